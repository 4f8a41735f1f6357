// examples/plaintext.rs
use lectern_core::{Request, Response, Server, ServerConfig, init_logging};

fn plaintext(requests: &[Request<'_>], responses: &mut [Response]) {
    for (req, res) in requests.iter().zip(responses.iter_mut()) {
        match req.path() {
            "/plaintext" => {
                res.content_type("text/plain").body_static(b"Hello, world!\n");
            }
            _ => {
                res.set_status(404).body_static(b"Not Found");
            }
        }
    }
}

fn main() {
    init_logging();

    let config = ServerConfig::from_env();
    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = server.serve(plaintext) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
