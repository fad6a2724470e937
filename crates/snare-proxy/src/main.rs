use std::env;
use std::process;
use std::time::Duration;

use snare_certs::CertStore;
use snare_core::{Config, ErrorKind, PROXY_SERVER_FATAL};
use snare_log::{Level, Logger, RequestWriter, WebhookWriter};
use snare_proxy::MitmProxy;

fn usage() -> ! {
    eprintln!("usage: snareproxy [config.json]");
    eprintln!("       snareproxy generate-ca [hours]");
    process::exit(1);
}

fn build_logger(config: &Config) -> Logger {
    let mut builder = Logger::builder(config.log_level).stdout(config.log_format);
    if !config.request_log_file.is_empty() {
        builder = builder.writer(RequestWriter::new(config.request_log_file.clone()));
    }
    if !config.webhook_url.is_empty() {
        builder = builder.writer(WebhookWriter::new(config.webhook_url.clone()));
    }
    builder.build()
}

fn generate_ca(args: &[String]) -> ! {
    let hours: u64 = match args.first() {
        Some(value) => match value.parse() {
            Ok(hours) => hours,
            Err(_) => usage(),
        },
        None => 0,
    };

    let logger = Logger::builder(Level::Info)
        .stdout(snare_log::Format::Text)
        .build();
    let certs = CertStore::new(snare_core::DEFAULT_KEY_BITS);
    if let Err(error) = certs.generate_ca(Duration::from_secs(hours * 60 * 60)) {
        logger.with_error(&error).fatal("failed to generate certificate authority");
    }
    match certs.write_ca("", "") {
        Ok((cert_path, key_path)) => {
            logger
                .with_field("ca_cert_file", cert_path.display().to_string())
                .with_field("ca_key_file", key_path.display().to_string())
                .info("certificate authority written");
            process::exit(0);
        }
        Err(error) => {
            logger.with_error(&error).fatal("failed to write certificate authority");
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("generate-ca") {
        generate_ca(&args[1..]);
    }

    let config = match args.first() {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("snareproxy: {error}");
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    let logger = build_logger(&config);
    let mut proxy = MitmProxy::new(config, logger.clone());
    if let Err(error) = proxy.run().await {
        let exit_code = match error.kind() {
            ErrorKind::TlsProxyStart | ErrorKind::HttpProxyStart | ErrorKind::ProxyShutdown => {
                PROXY_SERVER_FATAL
            }
            _ => 1,
        };
        logger
            .with_error(&error)
            .with_exit_code(exit_code)
            .fatal("proxy server failed");
    }
}
