use std::io;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::XFF_HEADER;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed status line")]
    MalformedStatusLine,
    #[error("malformed header line")]
    MalformedHeader,
    #[error("malformed chunk framing")]
    MalformedChunk,
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One client request, parsed from the stream in three stages: request
/// line, headers (which also folds in the client's own address), payload.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    path: String,
    server: String,
    port: u16,
    protocol: String,
    headers: HeaderMap,
    payload: Bytes,
}

impl Request {
    pub async fn ingest_request_line<R>(reader: &mut R) -> Result<Self, ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = read_crlf_line(reader).await?;
        let mut parts = line.split_whitespace();
        let (Some(method), Some(target), Some(protocol), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::MalformedRequestLine);
        };
        let method =
            Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::MalformedRequestLine)?;
        let uri: Uri = target.parse().map_err(|_| ParseError::MalformedRequestLine)?;
        // A forward proxy only sees absolute-form targets; anything without
        // an authority cannot be routed.
        let server = uri
            .host()
            .ok_or(ParseError::MalformedRequestLine)?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);
        let path = match uri.path_and_query() {
            Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
            _ => "/".to_string(),
        };
        Ok(Self {
            method,
            url: target.to_string(),
            path,
            server,
            port,
            protocol: protocol.to_string(),
            headers: HeaderMap::new(),
            payload: Bytes::new(),
        })
    }

    /// Reads headers up to the blank line. The client's address is appended
    /// to `x-forwarded-for` here, so the value seen by loop detection and
    /// forwarded upstream already includes this hop's client.
    pub async fn ingest_headers<R>(
        &mut self,
        reader: &mut R,
        client_ip: &str,
    ) -> Result<(), ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut forwarded: Option<String> = None;
        loop {
            let line = read_crlf_line(reader).await?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or(ParseError::MalformedHeader)?;
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case(XFF_HEADER) {
                // Multi-value x-forwarded-for collapses to one comma-joined
                // value, no space, so cycle counting can split on ','.
                match forwarded.as_mut() {
                    Some(existing) => {
                        existing.push(',');
                        existing.push_str(value);
                    }
                    None => forwarded = Some(value.to_string()),
                }
                continue;
            }
            let name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|_| ParseError::MalformedHeader)?;
            let value = HeaderValue::from_str(value).map_err(|_| ParseError::MalformedHeader)?;
            self.headers.append(name, value);
        }
        let chain = match forwarded {
            Some(mut existing) => {
                existing.push(',');
                existing.push_str(client_ip);
                existing
            }
            None => client_ip.to_string(),
        };
        let value = HeaderValue::from_str(&chain).map_err(|_| ParseError::MalformedHeader)?;
        self.headers.insert(XFF_HEADER, value);
        Ok(())
    }

    /// Reads the request payload; only Content-Length framing applies on
    /// the request side.
    pub async fn ingest_payload<R>(&mut self, reader: &mut R) -> Result<(), ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let len = content_length(&self.headers);
        if len > 0 {
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            self.payload = Bytes::from(buf);
        }
        Ok(())
    }

    /// Serializes toward an origin server: origin-form request target.
    pub async fn write_origin_form<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_with_target(writer, &self.path).await
    }

    /// Serializes toward a next-hop proxy: the full URL stays on the
    /// request line so the upstream proxy can route it.
    pub async fn write_absolute_form<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_with_target(writer, &self.url).await
    }

    async fn write_with_target<W>(&self, writer: &mut W, target: &str) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let line = format!("{} {} {}\r\n", self.method, target, self.protocol);
        writer.write_all(line.as_bytes()).await?;
        write_headers(&self.headers, writer).await?;
        writer.write_all(b"\r\n").await?;
        if !self.payload.is_empty() {
            writer.write_all(&self.payload).await?;
        }
        writer.flush().await
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// One upstream response, either parsed off an origin/upstream connection
/// or synthesized locally.
#[derive(Debug, Clone)]
pub struct Response {
    code: u16,
    protocol: String,
    headers: HeaderMap,
    payload: Bytes,
}

impl Response {
    pub fn synthesize(code: u16, payload: &str) -> Self {
        Self {
            code,
            protocol: crate::constants::SYNTH_PROTOCOL.to_string(),
            headers: HeaderMap::new(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    pub async fn ingest_header<R>(reader: &mut R) -> Result<Self, ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = read_crlf_line(reader).await?;
        let mut parts = line.splitn(3, ' ');
        let (Some(protocol), Some(code)) = (parts.next(), parts.next()) else {
            return Err(ParseError::MalformedStatusLine);
        };
        let code: u16 = code.parse().map_err(|_| ParseError::MalformedStatusLine)?;
        let mut headers = HeaderMap::new();
        loop {
            let line = read_crlf_line(reader).await?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or(ParseError::MalformedHeader)?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| ParseError::MalformedHeader)?;
            let value =
                HeaderValue::from_str(value.trim()).map_err(|_| ParseError::MalformedHeader)?;
            headers.append(name, value);
        }
        Ok(Self {
            code,
            protocol: protocol.to_string(),
            headers,
            payload: Bytes::new(),
        })
    }

    /// Reads the payload using whichever framing the upstream declared:
    /// chunked transfer (re-framed to Content-Length), Content-Length, or
    /// read-to-close.
    pub async fn ingest_payload<R>(&mut self, reader: &mut R) -> Result<(), ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        if self.is_chunked() {
            let body = read_chunked(reader).await?;
            self.headers.remove(TRANSFER_ENCODING);
            self.set_content_length(body.len());
            self.payload = Bytes::from(body);
            return Ok(());
        }
        if self.headers.contains_key(CONTENT_LENGTH) {
            let len = content_length(&self.headers);
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            self.payload = Bytes::from(buf);
            return Ok(());
        }
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        self.set_content_length(buf.len());
        self.payload = Bytes::from(buf);
        Ok(())
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let line = format!("{} {} {}\r\n", self.protocol, self.code, self.reason());
        writer.write_all(line.as_bytes()).await?;
        write_headers(&self.headers, writer).await?;
        if !self.headers.contains_key(CONTENT_LENGTH) {
            let cl = format!("content-length: {}\r\n", self.payload.len());
            writer.write_all(cl.as_bytes()).await?;
        }
        writer.write_all(b"\r\n").await?;
        if !self.payload.is_empty() {
            writer.write_all(&self.payload).await?;
        }
        writer.flush().await
    }

    pub fn status(&self) -> u16 {
        self.code
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn reason(&self) -> &'static str {
        StatusCode::from_u16(self.code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown")
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get(TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    fn set_content_length(&mut self, len: usize) {
        let value = HeaderValue::from_str(&len.to_string()).expect("numeric header value");
        self.headers.insert(CONTENT_LENGTH, value);
    }
}

async fn read_crlf_line<R>(reader: &mut R) -> Result<String, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ParseError::UnexpectedEof);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

async fn read_chunked<R>(reader: &mut R) -> Result<Vec<u8>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_crlf_line(reader).await?;
        let size_token = line.split(';').next().unwrap_or("").trim();
        let size =
            usize::from_str_radix(size_token, 16).map_err(|_| ParseError::MalformedChunk)?;
        if size == 0 {
            // trailer section, up to the final blank line
            loop {
                let trailer = read_crlf_line(reader).await?;
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(ParseError::MalformedChunk);
        }
    }
}

async fn write_headers<W>(headers: &HeaderMap, writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for (name, value) in headers.iter() {
        writer.write_all(name.as_str().as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    Ok(())
}

fn content_length(headers: &HeaderMap) -> usize {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}
