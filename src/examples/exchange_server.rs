use latent_exchange::{MemoryExchange, ProtocolConfig};
use std::net::UdpSocket;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = ProtocolConfig::from_env()?;
    let exchange = MemoryExchange::new(config)?;

    let addr = std::env::var("LATENT_EXCHANGE_ADDR").unwrap_or_else(|_| "127.0.0.1:50051".to_string());
    let sock = UdpSocket::bind(&addr)?;
    tracing::info!(%addr, "latent exchange listening");

    let mut buf = vec![0u8; 65536]; // 64 KiB max datagram
    loop {
        let (size, src) = match sock.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "recv failed");
                continue;
            }
        };

        let reply = match std::str::from_utf8(&buf[..size]) {
            Ok(raw) => exchange.handle_json(raw),
            Err(_) => serde_json::json!({
                "error": {"kind": "serialization", "code": "SerializationError", "message": "request is not UTF-8"}
            })
            .to_string(),
        };
        tracing::debug!(%src, request_bytes = size, reply_bytes = reply.len(), "handled request");

        if let Err(e) = sock.send_to(reply.as_bytes(), src) {
            tracing::warn!(%src, error = %e, "reply failed");
        }
    }
}
