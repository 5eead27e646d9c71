#![allow(clippy::print_stderr, reason = "the command line reports failures on stderr")]

#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use rdp_client::{ClientConfig, Credentials, RdpClient, RdpEvent};
use seahorse::{App, Context, Flag, FlagType};
use tokio::net::TcpStream;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDRESS: &str = "127.0.0.1:3389";
const DEFAULT_LOG_LEVEL: isize = 1;

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(format!(
            "{command} -m <HOST:PORT> -u <USER> -p <PASSWORD> [-d <DOMAIN>] [-l <LEVEL>]\n\
            \n\
            \tLog levels: 0 debug, 1 info, 2 warn, 3 error. RUST_LOG overrides them.",
            command = env!("CARGO_PKG_NAME"),
        ))
        .flag(
            Flag::new("machine", FlagType::String)
                .alias("m")
                .description("Target host and port (default: 127.0.0.1:3389)"),
        )
        .flag(Flag::new("domain", FlagType::String).alias("d").description("Logon domain"))
        .flag(Flag::new("user", FlagType::String).alias("u").description("User name"))
        .flag(Flag::new("password", FlagType::String).alias("p").description("Password"))
        .flag(Flag::new("log-level", FlagType::Int).alias("l").description("Log level (0-3)"))
        .action(login_action);

    app.run(std::env::args().collect());
}

fn login_action(c: &Context) {
    let args = match LoginArgs::parse(c) {
        Ok(args) => args,
        Err(error) => {
            eprintln!("{error:#}");
            std::process::exit(1);
        }
    };

    if let Err(error) = setup_logger(args.log_level) {
        eprintln!("{error:#}");
        std::process::exit(1);
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(error) => {
            eprintln!("runtime build failed: {error}");
            std::process::exit(1);
        }
    };

    // Login failures are reported, not turned into an exit code.
    if let Err(error) = rt.block_on(run(args)) {
        eprintln!("{error:#}");
    }
}

struct LoginArgs {
    address: String,
    domain: String,
    username: String,
    password: String,
    log_level: isize,
}

impl LoginArgs {
    fn parse(c: &Context) -> anyhow::Result<Self> {
        let username = c
            .string_flag("user")
            .ok()
            .filter(|user| !user.is_empty())
            .context("a user name is required (-u)")?;
        let password = c
            .string_flag("password")
            .ok()
            .filter(|password| !password.is_empty())
            .context("a password is required (-p)")?;

        Ok(Self {
            address: c.string_flag("machine").unwrap_or_else(|_| DEFAULT_ADDRESS.to_owned()),
            domain: c.string_flag("domain").unwrap_or_default(),
            username,
            password,
            log_level: c.int_flag("log-level").unwrap_or(DEFAULT_LOG_LEVEL),
        })
    }
}

fn setup_logger(log_level: isize) -> anyhow::Result<()> {
    let level = match log_level {
        ..=0 => LevelFilter::DEBUG,
        1 => LevelFilter::INFO,
        2 => LevelFilter::WARN,
        _ => LevelFilter::ERROR,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()
        .context("invalid RUST_LOG directives")?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error))
        .context("failed to install the logger")
}

async fn run(args: LoginArgs) -> anyhow::Result<()> {
    let server_name = args
        .address
        .rsplit_once(':')
        .map_or(args.address.as_str(), |(host, _)| host)
        .to_owned();

    let config = ClientConfig::builder()
        .credentials(
            Credentials::builder()
                .domain(args.domain)
                .username(args.username)
                .password(&args.password)
                .build(),
        )
        .server_name(server_name)
        .build();

    let (client, mut events) = RdpClient::new(config).context("invalid configuration")?;
    let handle = client.handle();

    let stream = tokio::time::timeout(client.config().connect_timeout, TcpStream::connect(&args.address))
        .await
        .with_context(|| format!("timed out connecting to {}", args.address))?
        .with_context(|| format!("failed to connect to {}", args.address))?;
    info!(address = %args.address, "Connected");

    let login = client.login(stream);
    tokio::pin!(login);

    loop {
        tokio::select! {
            result = &mut login => {
                while let Ok(event) = events.try_recv() {
                    report(&event);
                }
                return result.context("login failed");
            }
            Some(event) = events.recv() => report(&event),
            Ok(()) = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting the session down");
                if let Err(error) = handle.shutdown().await {
                    warn!(%error, "Shutdown request not delivered");
                }
            }
        }
    }
}

fn report(event: &RdpEvent) {
    match event {
        RdpEvent::Update(rectangles) => debug!(rectangles = rectangles.len(), "Screen update"),
        RdpEvent::Error(error) => warn!(%error, "Session error"),
        other => info!(event = other.name(), "Session event"),
    }
}
