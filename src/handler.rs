use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;

use crate::access_log::AccessLogger;
use crate::blacklist::Blacklist;
use crate::cache::{CacheStatus, HttpCache};
use crate::constants::{FORBIDDEN_PAYLOAD, GATEWAY_TIMEOUT_PAYLOAD, XFF_HEADER};
use crate::message::{ParseError, Request, Response};
use crate::net;

#[derive(Debug, Error)]
enum ServiceError {
    #[error("malformed request: {0}")]
    MalformedRequest(#[source] ParseError),
    #[error("connect to {host}:{port} failed")]
    ConnectFailed { host: String, port: u16 },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum Prologue {
    Proceed(Request),
    LoopDetected(Request),
}

/// Services one client connection end to end. Terminal mode owns the
/// blacklist gate and the cache locking protocol; chained mode is a plain
/// relay to a fixed upstream proxy. The two paths stay separate on purpose
/// so neither mode's invariants bleed into the other.
pub struct RequestHandler {
    cache: Arc<HttpCache>,
    blacklist: Arc<Blacklist>,
    access_log: Option<Arc<AccessLogger>>,
}

impl RequestHandler {
    pub fn new(
        cache: Arc<HttpCache>,
        blacklist: Arc<Blacklist>,
        access_log: Option<Arc<AccessLogger>>,
    ) -> Self {
        Self {
            cache,
            blacklist,
            access_log,
        }
    }

    /// Terminal mode: the proxy is the last hop before the origin server.
    /// Never returns an error; every failure is absorbed here and ends the
    /// exchange, at worst silently.
    pub async fn service_request(&self, stream: TcpStream, client_ip: String) {
        if let Err(err) = self.service_terminal(stream, &client_ip).await {
            log::debug!("request from {client_ip} dropped: {err}");
        }
    }

    /// Chained mode: relay the whole request to the configured next-hop
    /// proxy. No blacklist, no cache, no locking.
    pub async fn service_chained(
        &self,
        stream: TcpStream,
        client_ip: String,
        proxy_server: &str,
        proxy_port: u16,
    ) {
        if let Err(err) = self
            .service_chain(stream, &client_ip, proxy_server, proxy_port)
            .await
        {
            log::debug!("chained request from {client_ip} dropped: {err}");
        }
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    pub fn set_cache_max_age(&self, max_age: Duration) {
        self.cache.set_max_age(max_age);
    }

    async fn service_terminal(
        &self,
        stream: TcpStream,
        client_ip: &str,
    ) -> Result<(), ServiceError> {
        let mut client = BufReader::new(stream);
        let request = match self.form_request(&mut client, client_ip).await? {
            Prologue::Proceed(request) => request,
            Prologue::LoopDetected(request) => {
                self.log_access(client_ip, &request, 504, "-");
                return Ok(());
            }
        };

        if !self.blacklist.is_allowed(request.server()) {
            let response = Response::synthesize(403, FORBIDDEN_PAYLOAD);
            response.write_to(&mut client).await?;
            self.log_access(client_ip, &request, 403, "-");
            return Ok(());
        }

        // The bucket guard spans the cache check, the whole origin round
        // trip, and the store. Concurrent duplicates of this request block
        // here and then serve the freshly cached response instead of each
        // contacting the origin.
        let index = self.cache.bucket_index(&request);
        let mut bucket = self.cache.lock_bucket(index).await;

        if let Some(response) = self.cache.lookup(&mut bucket, &request) {
            response.write_to(&mut client).await?;
            self.log_access(
                client_ip,
                &request,
                response.status(),
                CacheStatus::Hit.as_str(),
            );
            return Ok(());
        }

        let origin = net::connect(request.server(), request.port())
            .await
            .map_err(|_| ServiceError::ConnectFailed {
                host: request.server().to_string(),
                port: request.port(),
            })?;
        let mut origin = BufReader::new(origin);

        request.write_origin_form(&mut origin).await?;
        let mut response = Response::ingest_header(&mut origin).await?;
        if request.method() != Method::HEAD {
            response.ingest_payload(&mut origin).await?;
        }
        if self.cache.should_cache(&request, &response) {
            self.cache.store(&mut bucket, &request, &response);
        }
        drop(bucket);

        response.write_to(&mut client).await?;
        self.log_access(
            client_ip,
            &request,
            response.status(),
            CacheStatus::Miss.as_str(),
        );
        Ok(())
    }

    async fn service_chain(
        &self,
        stream: TcpStream,
        client_ip: &str,
        proxy_server: &str,
        proxy_port: u16,
    ) -> Result<(), ServiceError> {
        let mut client = BufReader::new(stream);
        let request = match self.form_request(&mut client, client_ip).await? {
            Prologue::Proceed(request) => request,
            Prologue::LoopDetected(request) => {
                self.log_access(client_ip, &request, 504, "-");
                return Ok(());
            }
        };

        let upstream =
            net::connect(proxy_server, proxy_port)
                .await
                .map_err(|_| ServiceError::ConnectFailed {
                    host: proxy_server.to_string(),
                    port: proxy_port,
                })?;
        let mut upstream = BufReader::new(upstream);

        request.write_absolute_form(&mut upstream).await?;
        let mut response = Response::ingest_header(&mut upstream).await?;
        if request.method() != Method::HEAD {
            response.ingest_payload(&mut upstream).await?;
        }
        response.write_to(&mut client).await?;
        self.log_access(
            client_ip,
            &request,
            response.status(),
            CacheStatus::Bypass.as_str(),
        );
        Ok(())
    }

    /// Shared prologue of both modes: request line, headers (folding in the
    /// client address), loop check, payload. A detected loop answers 504
    /// right here, before any upstream is contacted.
    async fn form_request<S>(
        &self,
        client: &mut S,
        client_ip: &str,
    ) -> Result<Prologue, ServiceError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin,
    {
        let mut request = Request::ingest_request_line(client)
            .await
            .map_err(ServiceError::MalformedRequest)?;
        request.ingest_headers(client, client_ip).await?;

        let looped = request
            .header_value(XFF_HEADER)
            .map(has_forwarding_cycle)
            .unwrap_or(false);
        if looped {
            let response = Response::synthesize(504, GATEWAY_TIMEOUT_PAYLOAD);
            response.write_to(client).await?;
            return Ok(Prologue::LoopDetected(request));
        }

        if request.method() != Method::HEAD {
            request.ingest_payload(client).await?;
        }
        Ok(Prologue::Proceed(request))
    }

    fn log_access(&self, client_ip: &str, request: &Request, status: u16, cache_status: &str) {
        if let Some(logger) = &self.access_log {
            logger.log_request(client_ip, request.method(), request.url(), status, cache_status);
        }
    }
}

/// A forwarding cycle exists when some address repeats in the
/// x-forwarded-for chain: fewer distinct entries than total entries.
/// Empty segments count as entries, so repeated trailing delimiters also
/// trip the check.
fn has_forwarding_cycle(value: &str) -> bool {
    let mut entries = 0usize;
    let mut distinct = HashSet::new();
    for segment in value.split(',') {
        entries += 1;
        distinct.insert(segment.trim());
    }
    distinct.len() < entries
}

#[cfg(test)]
mod tests {
    use super::has_forwarding_cycle;

    #[test]
    fn single_entry_is_not_a_cycle() {
        assert!(!has_forwarding_cycle("1.1.1.1"));
    }

    #[test]
    fn distinct_entries_are_not_a_cycle() {
        assert!(!has_forwarding_cycle("1.1.1.1,2.2.2.2"));
        assert!(!has_forwarding_cycle("1.1.1.1, 2.2.2.2, 3.3.3.3"));
    }

    #[test]
    fn repeated_entry_is_a_cycle() {
        assert!(has_forwarding_cycle("1.1.1.1,2.2.2.2,1.1.1.1"));
        assert!(has_forwarding_cycle("1.1.1.1, 2.2.2.2, 1.1.1.1"));
        assert!(has_forwarding_cycle("1.1.1.1,1.1.1.1"));
    }

    #[test]
    fn one_trailing_delimiter_is_tolerated() {
        // the empty segment still counts as an entry but is distinct
        assert!(!has_forwarding_cycle("1.1.1.1,"));
        assert!(has_forwarding_cycle("1.1.1.1,,"));
    }
}
