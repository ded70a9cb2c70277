use argparse::{ArgumentParser, Store, StoreOption};
use log::info;

use wampcore::router::Router;

fn main() {
    env_logger::init();

    let mut realm = "realm1".to_string();
    let mut ws_addr = "127.0.0.1:8080".to_string();
    let mut tcp_addr: Option<String> = None;
    let mut unix_path: Option<String> = None;
    {
        let mut ap = ArgumentParser::new();
        ap.set_description("WAMP router with WebSocket and raw socket endpoints.");
        ap.refer(&mut realm)
            .add_option(&["-r", "--realm"], Store, "Realm to serve");
        ap.refer(&mut ws_addr).add_option(
            &["-w", "--ws"],
            Store,
            "WebSocket listen address (host:port)",
        );
        ap.refer(&mut tcp_addr).add_option(
            &["-t", "--tcp"],
            StoreOption,
            "Raw socket listen address (host:port)",
        );
        ap.refer(&mut unix_path).add_option(
            &["-u", "--unix"],
            StoreOption,
            "Raw socket unix domain socket path",
        );
        ap.parse_args_or_exit();
    }

    let router = Router::new();
    router.add_realm(&realm);
    info!("Router serving realm {}", realm);

    if let Some(addr) = tcp_addr {
        match router.listen_tcp(&addr[..]) {
            Ok((_, local_addr)) => info!("Raw socket endpoint on {}", local_addr),
            Err(e) => {
                eprintln!("Could not listen on tcp {}: {}", addr, e);
                std::process::exit(1);
            }
        }
    }
    #[cfg(unix)]
    {
        if let Some(path) = unix_path {
            if let Err(e) = router.listen_unix(std::path::Path::new(&path)) {
                eprintln!("Could not listen on unix {}: {}", path, e);
                std::process::exit(1);
            }
        }
    }

    let child = router.listen_ws(&ws_addr);
    child.join().unwrap();
}
