use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    process,
    str::FromStr,
    time::Duration,
};

mod ip;
mod logger;
mod nat;
mod obfuscation;
mod server;
mod tun;
mod tunnel;

enum Action {
    Serve(server::Config),
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: burrowgate [OPTIONS] serve\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --listen-ip=<IP>                 Listen IP address [default: ::]\
\n      --listen-port=<PORT>             Listen TCP port [default: 20080]\
\n      --public-ipv4=<IP>               Public IPv4 address for outbound traffic (required)\
\n      --public-ipv6=<IP>               Public IPv6 address for outbound traffic\
\n      --max-tunnels=<COUNT>            Maximum number of TUN interfaces, up to 156 [default: 5]\
\n      --cover-delay-min=<MS>           Minimum cover traffic delay, in milliseconds [default: 100]\
\n      --cover-delay-max=<MS>           Maximum cover traffic delay, in milliseconds [default: 1000]\
\n      --nat-idle-timeout=<SECONDS>     Evict NAT connections idle for this long [default: no eviction]\
\n      --help                           Print help";

impl Args {
    fn parse() -> Args {
        let fail_with_error = |name: &str, value: &str, err: fmt::Arguments| {
            eprintln!(
                "Argument {} has an unsupported value {}: {}",
                name, value, err
            );
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        let mut log_level = log::LevelFilter::Info;
        let mut listen_ip = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
        let mut listen_port = 20080u16;
        let mut public_ipv4 = None;
        let mut public_ipv6 = None;
        let mut max_tunnels = 5usize;
        let mut cover_delay_min = 100u64;
        let mut cover_delay_max = 1000u64;
        let mut nat_idle_timeout = None;

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported log level"));
                        process::exit(2);
                    }
                };
            } else if name == "--listen-ip" {
                match IpAddr::from_str(value) {
                    Ok(ip) => listen_ip = ip,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IP address: {}", err),
                    ),
                };
            } else if name == "--listen-port" {
                match u16::from_str(value) {
                    Ok(port) => listen_port = port,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Failed to parse port: {}", err))
                    }
                };
            } else if name == "--public-ipv4" {
                match Ipv4Addr::from_str(value) {
                    Ok(ip) => public_ipv4 = Some(ip),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IPv4 address: {}", err),
                    ),
                };
            } else if name == "--public-ipv6" {
                match Ipv6Addr::from_str(value) {
                    Ok(ip) => public_ipv6 = Some(ip),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IPv6 address: {}", err),
                    ),
                };
            } else if name == "--max-tunnels" {
                match usize::from_str(value) {
                    Ok(count) if count > 0 && count <= tun::MAX_POOL_CAPACITY => {
                        max_tunnels = count
                    }
                    Ok(_) => fail_with_error(
                        name,
                        value,
                        format_args!(
                            "Tunnel count must be between 1 and {}",
                            tun::MAX_POOL_CAPACITY
                        ),
                    ),
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Failed to parse count: {}", err))
                    }
                };
            } else if name == "--cover-delay-min" {
                match u64::from_str(value) {
                    Ok(ms) => cover_delay_min = ms,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Failed to parse delay: {}", err))
                    }
                };
            } else if name == "--cover-delay-max" {
                match u64::from_str(value) {
                    Ok(ms) => cover_delay_max = ms,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Failed to parse delay: {}", err))
                    }
                };
            } else if name == "--nat-idle-timeout" {
                match u64::from_str(value) {
                    Ok(seconds) => nat_idle_timeout = Some(Duration::from_secs(seconds)),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse timeout: {}", err),
                    ),
                };
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        match action.as_str() {
            "serve" => {
                let public_ipv4 = if let Some(public_ipv4) = public_ipv4 {
                    public_ipv4
                } else {
                    eprintln!("No public IPv4 address specified");
                    println!("{}", USAGE_INSTRUCTIONS);
                    process::exit(2);
                };
                let cover_delays =
                    match obfuscation::DelayWindow::new(cover_delay_min, cover_delay_max) {
                        Ok(cover_delays) => cover_delays,
                        Err(err) => {
                            eprintln!("Unsupported cover traffic delays: {}", err);
                            println!("{}", USAGE_INSTRUCTIONS);
                            process::exit(2);
                        }
                    };

                let action = Action::Serve(server::Config {
                    listen_addr: SocketAddr::new(listen_ip, listen_port),
                    public_ipv4,
                    public_ipv6,
                    max_tunnels,
                    cover_delays,
                    nat_idle_timeout,
                });
                Args { log_level, action }
            }
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
    }
}

fn main() {
    println!(
        "Burrowgate version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    match args.action {
        Action::Serve(config) => {
            let server = match server::Server::new(config) {
                Ok(server) => server,
                Err(err) => {
                    println!("Failed to create server, error is {}", err);
                    std::process::exit(1)
                }
            };
            if let Err(err) = server.run() {
                println!("Failed to run server, error is {}", err);
                std::process::exit(1);
            }
        }
    }
}
