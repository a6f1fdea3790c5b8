//! TCP listener and per-connection loops.
//!
//! One task per connection; frames are single reads of up to 1024 bytes.
//! Every loop observes the shutdown channel and exits at its next wakeup;
//! in-flight match passes run to completion inside the engine.

mod dispatcher;

pub use dispatcher::{dispatch, market_report, ExchangeContext, Outcome};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const FRAME_SIZE: usize = 1024;

/// Accept connections until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    ctx: ExchangeContext,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::info!(%addr, "client connected");
                    tokio::spawn(handle_connection(stream, ctx.clone(), shutdown.clone()));
                }
                Err(e) => tracing::error!("accept failed: {e}"),
            },
        }
    }
    tracing::info!("accept loop stopped");
}

async fn handle_connection(
    mut stream: TcpStream,
    ctx: ExchangeContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; FRAME_SIZE];
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = stream.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("connection read failed: {e}");
                break;
            }
        };
        if ctx.session.is_closed() {
            break;
        }

        let input = String::from_utf8_lossy(&buf[..n]).into_owned();
        match dispatch(&ctx, &input).await {
            Outcome::Reply(reply) => {
                if stream.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            Outcome::ReplyAndClose(reply) => {
                let _ = stream.write_all(reply.as_bytes()).await;
                break;
            }
            Outcome::Close => break,
            Outcome::Silent => {}
        }
    }
}
