//! The SQLBridge binary: one process, two listeners. The proxy listener
//! relays clients to a pool of MySQL backends under script control; the
//! master listener answers clients on its own from scripted input.

#![warn(rust_2018_idioms)]

use std::process;

use clap::{App, Arg};
use log::error;

use bridge_common::config::config::BridgeConfig;

mod server;

fn main() {
    env_logger::init();

    let matches = App::new("sqlbridge")
        .version("0.1.0")
        .about("a scriptable interposer for the MySQL wire protocol")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .value_name("FILE")
                .help("configuration file (TOML)"),
        )
        .arg(
            Arg::with_name("proxy-address")
                .long("proxy-address")
                .takes_value(true)
                .value_name("host:port")
                .help("listening address:port of the proxy listener (default: :4040)"),
        )
        .arg(
            Arg::with_name("master-address")
                .long("master-address")
                .takes_value(true)
                .value_name("host:port")
                .help("listening address:port of the master listener (default: :4041)"),
        )
        .arg(
            Arg::with_name("proxy-backend-addresses")
                .long("proxy-backend-addresses")
                .takes_value(true)
                .multiple(true)
                .value_name("host:port")
                .help("address:port of the remote backend servers (default: 127.0.0.1:3306)"),
        )
        .arg(
            Arg::with_name("proxy-script")
                .long("proxy-script")
                .takes_value(true)
                .value_name("FILE")
                .help("connection script for the proxy listener"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => match BridgeConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("cannot load {}: {}", path, e);
                process::exit(1);
            }
        },
        None => BridgeConfig::default(),
    };

    if let Some(address) = matches.value_of("proxy-address") {
        config.proxy.address = address.to_string();
    }
    if let Some(address) = matches.value_of("master-address") {
        config.master.address = address.to_string();
    }
    if let Some(addresses) = matches.values_of("proxy-backend-addresses") {
        config.proxy.backend_addresses = addresses.map(|a| a.to_string()).collect();
    }
    if let Some(script) = matches.value_of("proxy-script") {
        config.proxy.script = Some(script.to_string());
    }

    let workers = config.system.workers.max(1);
    config.make_current();
    let config = BridgeConfig::current();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start the runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(server::run(config)) {
        error!("{}", e);
        process::exit(1);
    }
}
