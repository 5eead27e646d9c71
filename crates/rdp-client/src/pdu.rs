//! Share control state machine: capability exchange, connection finalization, and the update
//! streams of an active session.
//!
//! The machine does no I/O. Each inbound PDU yields a list of [`PduOutput`]s which the session
//! carries out in order.

use rdp_proto::capabilities::{ClientCapabilities, NegotiatedCapabilities};
use rdp_proto::fast_path::{self, FastPathUpdate, Reassembler};
use rdp_proto::share::{
    ConfirmActive, ControlAction, DemandActive, ErrorInfo, SERVER_CHANNEL_ID, ShareControlMessage, ShareControlPdu,
    ShareDataPdu,
};
use rdp_proto::update::{BitmapUpdate, PointerUpdate, SlowPathUpdate};

use crate::error::{RdpError, RdpResult};
use crate::event::{RdpEvent, UpdateRectangle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    AwaitingDemandActive,
    CapabilityExchange,
    /// Confirm Active and the client finalization PDUs are out; waiting on the server Synchronize.
    ConfirmActiveSent,
    /// Server Synchronize seen; control and font map PDUs still pending.
    InputSynchronized,
    Active,
}

/// Server finalization PDUs expected after Synchronize, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finalization {
    Cooperate,
    GrantedControl,
    FontMap,
}

#[derive(Debug)]
pub enum PduOutput {
    Send(ShareControlPdu),
    Emit(RdpEvent),
    /// Both ends agreed on whether MACs are salted with the packet count.
    SaltedChecksum(bool),
    /// The server answered our shutdown request.
    ShutdownAcknowledged,
}

#[derive(Debug)]
pub struct PduLayer {
    state: ActivationState,
    pending: Finalization,
    user_id: u16,
    share_id: Option<u32>,
    capabilities: ClientCapabilities,
    negotiated: Option<NegotiatedCapabilities>,
    reassembler: Reassembler,
    shutdown_requested: bool,
    error_info: ErrorInfo,
}

impl PduLayer {
    pub fn new(user_id: u16, capabilities: ClientCapabilities) -> Self {
        let reassembler = Reassembler::new(capabilities.multifragment_max_size as usize);

        Self {
            state: ActivationState::AwaitingDemandActive,
            pending: Finalization::Cooperate,
            user_id,
            share_id: None,
            capabilities,
            negotiated: None,
            reassembler,
            shutdown_requested: false,
            error_info: ErrorInfo::NONE,
        }
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    pub fn negotiated(&self) -> Option<&NegotiatedCapabilities> {
        self.negotiated.as_ref()
    }

    /// Last Set Error Info code received, `ErrorInfo::NONE` when none was.
    pub fn error_info(&self) -> ErrorInfo {
        self.error_info
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub fn process(&mut self, pdu: ShareControlPdu) -> RdpResult<Vec<PduOutput>> {
        match pdu.message {
            ShareControlMessage::DemandActive(demand) => self.on_demand_active(demand),
            ShareControlMessage::DeactivateAll { share_id } => {
                info!(share_id, "Server deactivated the share");
                self.state = ActivationState::AwaitingDemandActive;
                self.share_id = None;
                Ok(Vec::new())
            }
            ShareControlMessage::Data { pdu, .. } => self.on_data(pdu),
            ShareControlMessage::ServerRedirect(_) => {
                warn!("Ignoring server redirection");
                Ok(Vec::new())
            }
            ShareControlMessage::ConfirmActive(_) => Err(RdpError::protocol("server sent a Confirm Active PDU")),
        }
    }

    fn on_demand_active(&mut self, demand: DemandActive) -> RdpResult<Vec<PduOutput>> {
        if self.state != ActivationState::AwaitingDemandActive {
            return Err(self.out_of_order("Demand Active"));
        }

        self.state = ActivationState::CapabilityExchange;

        let negotiated = self.capabilities.negotiate(&demand.capability_sets);
        debug!(
            share_id = demand.share_id,
            width = negotiated.desktop_width,
            height = negotiated.desktop_height,
            color_depth = negotiated.color_depth,
            fast_path_output = negotiated.fast_path_output,
            "Capabilities negotiated"
        );

        let share_id = demand.share_id;
        let outputs = vec![
            PduOutput::SaltedChecksum(negotiated.salted_checksum),
            PduOutput::Send(ShareControlPdu::new(
                self.user_id,
                ShareControlMessage::ConfirmActive(ConfirmActive {
                    share_id,
                    capability_sets: negotiated.sets.clone(),
                }),
            )),
            PduOutput::Send(self.data(
                share_id,
                ShareDataPdu::Synchronize {
                    target_user: SERVER_CHANNEL_ID,
                },
            )),
            PduOutput::Send(self.data(share_id, control(ControlAction::Cooperate))),
            PduOutput::Send(self.data(share_id, control(ControlAction::RequestControl))),
            PduOutput::Send(self.data(share_id, ShareDataPdu::FontList)),
        ];

        self.reassembler = Reassembler::new(negotiated.multifragment_max_size as usize);
        self.negotiated = Some(negotiated);
        self.share_id = Some(share_id);
        self.state = ActivationState::ConfirmActiveSent;

        Ok(outputs)
    }

    fn on_data(&mut self, pdu: ShareDataPdu) -> RdpResult<Vec<PduOutput>> {
        match pdu {
            ShareDataPdu::Synchronize { .. } => {
                if self.state != ActivationState::ConfirmActiveSent {
                    return Err(self.out_of_order("Synchronize"));
                }
                self.state = ActivationState::InputSynchronized;
                self.pending = Finalization::Cooperate;
                Ok(Vec::new())
            }
            ShareDataPdu::Control { action, .. } => {
                let expected = match action {
                    ControlAction::Cooperate => Finalization::Cooperate,
                    ControlAction::GrantedControl => Finalization::GrantedControl,
                    ControlAction::RequestControl | ControlAction::Detach => {
                        return Err(self.out_of_order("Control"));
                    }
                };
                self.advance_finalization(expected, "Control")?;
                Ok(Vec::new())
            }
            ShareDataPdu::FontMap => {
                self.advance_finalization(Finalization::FontMap, "Font Map")?;
                self.state = ActivationState::Active;
                info!("Session is active");
                Ok(vec![PduOutput::Emit(RdpEvent::Ready)])
            }
            ShareDataPdu::Update(data) => Ok(self.slow_path_update(&data).into_iter().collect()),
            ShareDataPdu::Pointer(data) => match PointerUpdate::decode_slow_path(&data) {
                Ok(pointer) => {
                    trace!(?pointer, "Pointer update");
                    Ok(Vec::new())
                }
                Err(error) => Ok(vec![batch_error(error)]),
            },
            ShareDataPdu::SaveSessionInfo { info_type } => {
                info!(info_type, "User logged on");
                Ok(vec![PduOutput::Emit(RdpEvent::Logon)])
            }
            ShareDataPdu::SetErrorInfo(error_info) => {
                if error_info != ErrorInfo::NONE {
                    warn!(%error_info, "Server set error info");
                    self.error_info = error_info;
                }
                Ok(Vec::new())
            }
            ShareDataPdu::ShutdownDenied if self.shutdown_requested => {
                debug!("Shutdown acknowledged");
                Ok(vec![PduOutput::ShutdownAcknowledged])
            }
            other => {
                trace!(pdu = other.name(), "Ignoring share data PDU");
                Ok(Vec::new())
            }
        }
    }

    fn advance_finalization(&mut self, step: Finalization, name: &str) -> RdpResult<()> {
        if self.state != ActivationState::InputSynchronized || self.pending != step {
            return Err(self.out_of_order(name));
        }

        self.pending = match step {
            Finalization::Cooperate => Finalization::GrantedControl,
            Finalization::GrantedControl | Finalization::FontMap => Finalization::FontMap,
        };

        Ok(())
    }

    /// Decodes a decrypted fast-path output payload. Decode failures only drop their own batch.
    pub fn process_fast_path(&mut self, payload: &[u8]) -> Vec<PduOutput> {
        let fragments = match fast_path::decode_update_fragments(payload) {
            Ok(fragments) => fragments,
            Err(error) => return vec![batch_error(error)],
        };

        let mut outputs = Vec::new();

        for fragment in &fragments {
            let (code, data) = match self.reassembler.push(fragment) {
                Ok(Some(update)) => update,
                Ok(None) => continue,
                Err(error) => {
                    outputs.push(batch_error(error));
                    continue;
                }
            };

            match FastPathUpdate::decode(code, &data) {
                Ok(FastPathUpdate::Bitmap(bitmap)) => outputs.push(bitmap_event(bitmap)),
                Ok(FastPathUpdate::Pointer(pointer)) => trace!(?pointer, "Pointer update"),
                Ok(update) => trace!(?update, "Ignoring fast-path update"),
                Err(error) => outputs.push(batch_error(error)),
            }
        }

        outputs
    }

    fn slow_path_update(&mut self, data: &[u8]) -> Option<PduOutput> {
        match SlowPathUpdate::decode(data) {
            Ok(SlowPathUpdate::Bitmap(bitmap)) => Some(bitmap_event(bitmap)),
            Ok(update) => {
                trace!(?update, "Ignoring slow-path update");
                None
            }
            Err(error) => Some(batch_error(error)),
        }
    }

    /// Asks the server to end the session; it answers with Shutdown Denied or a disconnect.
    pub fn request_shutdown(&mut self) -> Vec<PduOutput> {
        self.shutdown_requested = true;

        match self.share_id {
            Some(share_id) => vec![PduOutput::Send(self.data(share_id, ShareDataPdu::ShutdownRequest))],
            // No share to shut down yet.
            None => vec![PduOutput::ShutdownAcknowledged],
        }
    }

    fn data(&self, share_id: u32, pdu: ShareDataPdu) -> ShareControlPdu {
        ShareControlPdu::data(self.user_id, share_id, pdu)
    }

    fn out_of_order(&self, name: &str) -> RdpError {
        RdpError::protocol(format!("{name} PDU received out of order (state: {:?})", self.state))
    }
}

fn control(action: ControlAction) -> ShareDataPdu {
    ShareDataPdu::Control {
        action,
        grant_id: 0,
        control_id: 0,
    }
}

fn bitmap_event(bitmap: BitmapUpdate) -> PduOutput {
    let rectangles = bitmap.rectangles.into_iter().map(UpdateRectangle::from).collect();
    PduOutput::Emit(RdpEvent::Update(rectangles))
}

fn batch_error(error: rdp_proto::Error) -> PduOutput {
    warn!(%error, "Dropping undecodable update batch");
    PduOutput::Emit(RdpEvent::Error(RdpError::Decode(error)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rdp_proto::fast_path::{Fragmentation, UpdateCode, UpdateFragment};
    use rdp_proto::update::{BitmapData, BitmapEncoding};
    use rstest::rstest;

    use super::*;

    const USER_ID: u16 = 1007;
    const SHARE_ID: u32 = 0x0001_03EA;

    fn server(message: ShareControlMessage) -> ShareControlPdu {
        ShareControlPdu::new(SERVER_CHANNEL_ID, message)
    }

    fn server_data(pdu: ShareDataPdu) -> ShareControlPdu {
        ShareControlPdu::data(SERVER_CHANNEL_ID, SHARE_ID, pdu)
    }

    fn demand_active() -> ShareControlPdu {
        server(ShareControlMessage::DemandActive(DemandActive {
            share_id: SHARE_ID,
            source_descriptor: b"RDP\0".to_vec(),
            capability_sets: Vec::new(),
            session_id: 0,
        }))
    }

    fn finalization() -> Vec<ShareControlPdu> {
        vec![
            server_data(ShareDataPdu::Synchronize { target_user: USER_ID }),
            server_data(control(ControlAction::Cooperate)),
            server_data(control(ControlAction::GrantedControl)),
            server_data(ShareDataPdu::FontMap),
        ]
    }

    fn activate(layer: &mut PduLayer) -> Vec<PduOutput> {
        let mut outputs = layer.process(demand_active()).unwrap();
        for pdu in finalization() {
            outputs.extend(layer.process(pdu).unwrap());
        }
        outputs
    }

    fn bitmap_payload() -> Vec<u8> {
        let mut update = Vec::new();
        BitmapUpdate {
            rectangles: vec![BitmapData {
                left: 0,
                top: 0,
                right: 1,
                bottom: 0,
                width: 2,
                height: 1,
                bits_per_pixel: 16,
                encoding: BitmapEncoding::Raw,
                compressed_header: None,
                data: vec![0xFF; 4],
            }],
        }
        .encode(&mut update)
        .unwrap();
        update
    }

    fn fast_path_payload(fragments: &[(Fragmentation, &[u8])]) -> Vec<u8> {
        let mut payload = Vec::new();
        for (fragmentation, data) in fragments {
            UpdateFragment {
                code: UpdateCode::Bitmap as u8,
                fragmentation: *fragmentation,
                data,
            }
            .encode(&mut payload)
            .unwrap();
        }
        payload
    }

    #[test]
    fn demand_active_is_answered_with_confirm_and_finalization() {
        let mut layer = PduLayer::new(USER_ID, ClientCapabilities::default());
        let outputs = layer.process(demand_active()).unwrap();

        assert_eq!(layer.state(), ActivationState::ConfirmActiveSent);
        assert!(matches!(outputs[0], PduOutput::SaltedChecksum(false)));

        let sent: Vec<&ShareControlMessage> = outputs
            .iter()
            .filter_map(|output| match output {
                PduOutput::Send(pdu) => {
                    assert_eq!(pdu.source, USER_ID);
                    Some(&pdu.message)
                }
                _ => None,
            })
            .collect();

        assert_eq!(sent.len(), 5);
        assert!(matches!(sent[0], ShareControlMessage::ConfirmActive(ConfirmActive { share_id: SHARE_ID, .. })));
        assert!(matches!(
            sent[1],
            ShareControlMessage::Data {
                pdu: ShareDataPdu::Synchronize { .. },
                ..
            }
        ));
        assert!(matches!(
            sent[4],
            ShareControlMessage::Data {
                pdu: ShareDataPdu::FontList,
                ..
            }
        ));
    }

    #[test]
    fn finalization_ends_in_ready() {
        let mut layer = PduLayer::new(USER_ID, ClientCapabilities::default());
        let outputs = activate(&mut layer);

        assert_eq!(layer.state(), ActivationState::Active);
        let ready = outputs
            .iter()
            .filter(|output| matches!(output, PduOutput::Emit(RdpEvent::Ready)))
            .count();
        assert_eq!(ready, 1);
    }

    #[rstest]
    #[case::font_map_first(3)]
    #[case::granted_control_first(2)]
    #[case::cooperate_first(1)]
    fn out_of_order_finalization_is_a_protocol_violation(#[case] first: usize) {
        let mut layer = PduLayer::new(USER_ID, ClientCapabilities::default());
        layer.process(demand_active()).unwrap();

        let pdu = finalization().swap_remove(first);
        assert!(matches!(layer.process(pdu), Err(RdpError::Protocol(_))));
    }

    #[test]
    fn demand_active_while_active_is_a_protocol_violation() {
        let mut layer = PduLayer::new(USER_ID, ClientCapabilities::default());
        activate(&mut layer);

        assert!(matches!(layer.process(demand_active()), Err(RdpError::Protocol(_))));
    }

    #[test]
    fn deactivate_all_allows_reactivation() {
        let mut layer = PduLayer::new(USER_ID, ClientCapabilities::default());
        activate(&mut layer);

        let outputs = layer
            .process(server(ShareControlMessage::DeactivateAll { share_id: SHARE_ID }))
            .unwrap();
        assert!(outputs.is_empty());
        assert_eq!(layer.state(), ActivationState::AwaitingDemandActive);

        activate(&mut layer);
        assert_eq!(layer.state(), ActivationState::Active);
    }

    #[test]
    fn fast_path_bitmaps_become_update_events() {
        let mut layer = PduLayer::new(USER_ID, ClientCapabilities::default());
        activate(&mut layer);

        let update = bitmap_payload();
        let (first, rest) = update.split_at(5);
        let payload = fast_path_payload(&[(Fragmentation::First, first), (Fragmentation::Last, rest)]);

        let outputs = layer.process_fast_path(&payload);
        let [PduOutput::Emit(RdpEvent::Update(rectangles))] = outputs.as_slice() else {
            panic!("expected one update event, got {outputs:?}");
        };
        assert_eq!(rectangles.len(), 1);
        assert_eq!((rectangles[0].width, rectangles[0].height), (2, 1));
        assert_eq!(rectangles[0].data, vec![0xFF; 4]);
    }

    #[test]
    fn undecodable_batch_is_reported_and_skipped() {
        let mut layer = PduLayer::new(USER_ID, ClientCapabilities::default());
        activate(&mut layer);

        let broken = fast_path_payload(&[(Fragmentation::Single, &[0x01, 0x00, 0x05, 0x00])]);
        let outputs = layer.process_fast_path(&broken);
        assert!(matches!(outputs.as_slice(), [PduOutput::Emit(RdpEvent::Error(RdpError::Decode(_)))]));

        let outputs = layer.process_fast_path(&fast_path_payload(&[(Fragmentation::Single, &bitmap_payload())]));
        assert!(matches!(outputs.as_slice(), [PduOutput::Emit(RdpEvent::Update(_))]));

        let outputs = layer.process(server_data(ShareDataPdu::Update(vec![0x01]))).unwrap();
        assert!(matches!(outputs.as_slice(), [PduOutput::Emit(RdpEvent::Error(_))]));
    }

    #[test]
    fn session_info_and_error_info() {
        let mut layer = PduLayer::new(USER_ID, ClientCapabilities::default());
        activate(&mut layer);

        let outputs = layer
            .process(server_data(ShareDataPdu::SaveSessionInfo { info_type: 0 }))
            .unwrap();
        assert!(matches!(outputs.as_slice(), [PduOutput::Emit(RdpEvent::Logon)]));

        layer
            .process(server_data(ShareDataPdu::SetErrorInfo(ErrorInfo::LOGOFF_BY_USER)))
            .unwrap();
        assert_eq!(layer.error_info(), ErrorInfo::LOGOFF_BY_USER);
    }

    #[test]
    fn shutdown_denied_acknowledges_our_request() {
        let mut layer = PduLayer::new(USER_ID, ClientCapabilities::default());
        activate(&mut layer);

        // Unsolicited denials are ignored.
        assert!(layer.process(server_data(ShareDataPdu::ShutdownDenied)).unwrap().is_empty());

        let outputs = layer.request_shutdown();
        assert!(matches!(
            outputs.as_slice(),
            [PduOutput::Send(ShareControlPdu {
                message: ShareControlMessage::Data {
                    pdu: ShareDataPdu::ShutdownRequest,
                    ..
                },
                ..
            })]
        ));

        let outputs = layer.process(server_data(ShareDataPdu::ShutdownDenied)).unwrap();
        assert!(matches!(outputs.as_slice(), [PduOutput::ShutdownAcknowledged]));
    }
}
