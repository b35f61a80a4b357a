use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::access_log::AccessLogger;
use crate::blacklist::Blacklist;
use crate::cache::HttpCache;
use crate::config::Bootstrap;
use crate::handler::RequestHandler;
use crate::scheduler::Scheduler;

/// Binds the listener and runs the accept loop until ctrl-c. Accepted
/// connections are handed to the scheduler and never awaited here.
pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let cache = Arc::new(HttpCache::new());
    if let Some(max_age) = cfg.cache.max_age {
        cache.set_max_age(max_age);
    }

    let blacklist = Arc::new(load_blacklist(&cfg));
    let access_logger = build_access_logger(&cfg)?;

    let handler = Arc::new(RequestHandler::new(cache, blacklist, access_logger));
    let scheduler = Scheduler::new(Arc::clone(&handler), cfg.proxy.workers);
    let chain = cfg.proxy.chain_target()?;

    let listener = TcpListener::bind(&cfg.server.addr)
        .await
        .with_context(|| format!("bind {}", cfg.server.addr))?;
    match &chain {
        Some((host, port)) => {
            log::info!(
                "listening on {}, chaining all requests to {host}:{port}",
                cfg.server.addr
            );
        }
        None => log::info!("listening on {}", cfg.server.addr),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown signal received");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let client_ip = peer.ip().to_string();
                match &chain {
                    Some((host, port)) => {
                        scheduler.schedule_chained(stream, client_ip, host.clone(), *port);
                    }
                    None => scheduler.schedule_request(stream, client_ip),
                }
            }
        }
    }
}

/// A missing or unreadable blacklist is a warning, not a startup failure;
/// the proxy then runs with everything allowed.
fn load_blacklist(cfg: &Bootstrap) -> Blacklist {
    let path = cfg.blacklist.path.trim();
    if path.is_empty() {
        return Blacklist::default();
    }
    match Blacklist::load(Path::new(path)) {
        Ok(blacklist) => {
            log::info!("loaded {} blacklist patterns from {path}", blacklist.len());
            blacklist
        }
        Err(err) => {
            log::warn!("blacklist load failed: {err:#}; continuing without a blacklist");
            Blacklist::default()
        }
    }
}

fn build_access_logger(cfg: &Bootstrap) -> Result<Option<Arc<AccessLogger>>> {
    let Some(access) = cfg.server.access_log.as_ref().filter(|a| a.enabled) else {
        return Ok(None);
    };
    let logger = AccessLogger::new(Some(access.path.as_str())).context("open access log")?;
    Ok(Some(Arc::new(logger)))
}
