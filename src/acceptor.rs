//! Component G — Connection Acceptor.
//!
//! Grounded on flexo's `main` accept loop (bind, loop-accept, hand each
//! socket to a freshly spawned worker), spawning one task per connection.

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::request::{self, AppContext};

/// Binds the configured port (plus a second `::`-scoped listener when
/// `ipv6_enabled`, spec section 4.G) and spawns `request::handle_connection`
/// for every accepted socket. Runs until a listener errors out.
pub async fn run(ctx: AppContext) -> anyhow::Result<()> {
    let port = ctx.config.port;
    let ipv6_enabled = ctx.config.ipv6_enabled;

    let v4 = TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("listening on 0.0.0.0:{}", port);

    if ipv6_enabled {
        let ctx_v6 = ctx.clone();
        let v6 = TcpListener::bind(("::", port)).await?;
        log::info!("listening on [::]:{}", port);
        tokio::spawn(accept_loop(v6, ctx_v6));
    }

    accept_loop(v4, ctx).await
}

async fn accept_loop(listener: TcpListener, ctx: AppContext) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(e) = socket.set_nodelay(true) {
            log::warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let ctx = ctx.clone();
        tokio::spawn(async move {
            request::handle_connection(socket, ctx).await;
        });
    }
}
