//! Send one GET request and print whatever comes back.
//!
//! The response is printed raw, headers and all, as it arrives.
//! Use `--help` to see the options.

use color_eyre::eyre::eyre;
use httpreq::{Interface, PinningPolicy, Request};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = clap::Command::new("httpreq")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Minimal HTTP/1.1 client")
        .arg(
            clap::Arg::new("url")
                .help("The URL to request")
                .required(true),
        )
        .arg(
            clap::Arg::new("timeout")
                .short('t')
                .long("timeout")
                .help("Seconds before the request is cancelled")
                .value_parser(clap::value_parser!(f64))
                .default_value("10"),
        )
        .arg(
            clap::Arg::new("required-interface")
                .short('r')
                .long("required-interface")
                .help("Interface class to connect over (wifi, cellular, loopback, ethernet)")
                .value_parser(clap::value_parser!(Interface)),
        )
        .arg(
            clap::Arg::new("insecure")
                .short('i')
                .long("insecure")
                .alias("insecured")
                .action(clap::ArgAction::SetTrue)
                .help("Accept any certificate, printing its digest for pinning"),
        )
        .get_matches();

    let url = args
        .get_one::<String>("url")
        .ok_or_else(|| eyre!("a URL is required"))?;
    let timeout = *args.get_one::<f64>("timeout").unwrap_or(&10.0);
    let interface = args.get_one::<Interface>("required-interface").copied();
    let insecure = args.get_flag("insecure");

    println!("using:");
    println!("    url: {url}");
    println!("    timeout: {timeout}");
    match interface {
        Some(interface) => println!("    required interface: {interface}"),
        None => println!("    required interface: any"),
    }
    println!("    insecure allowed: {insecure}");

    let mut builder = Request::builder(url.as_str()).timeout_secs(timeout);
    if let Some(interface) = interface {
        builder = builder.interface(interface);
    }
    let request = builder.build();

    let pinning = if insecure {
        PinningPolicy::Insecure
    } else {
        PinningPolicy::Normal
    };

    let execution = request
        .call()
        .pinning(pinning)
        .on_data(|result| match result {
            Ok(data) => println!("{}", String::from_utf8_lossy(&data)),
            Err(error) => eprintln!("{error}"),
        })
        .start()?;

    execution.await?;
    Ok(())
}
