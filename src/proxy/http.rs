/// HTTP 代理实现
///
/// - CONNECT：拨号成功后回 200，接管底层连接做隧道转发
///   （RFC 7231 Section 4.3.6: https://www.rfc-editor.org/rfc/rfc7231#section-4.3.6）
/// - 其他方法：把请求原样转发给目标，再把响应流式写回客户端；
///   `https://` 目标先在出站连接上完成 TLS 握手
///
/// 两条路径都经过同一个 `Dialer`，因此都使用随机出口 IP。

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, HOST};
use http::uri::{PathAndQuery, Uri};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::utils::split_host_port;
use super::dialer::Dialer;
use super::relay::relay;
use super::socks5::TargetAddr;
use super::tls::connect_tls;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// 在一个客户端连接上提供 HTTP 代理服务
pub async fn serve_http<S>(stream: S, dialer: Arc<Dialer>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| proxy(req, dialer.clone()));

    server_http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await?;

    Ok(())
}

/// 按请求方法分派
async fn proxy(
    req: Request<Incoming>,
    dialer: Arc<Dialer>,
) -> std::result::Result<Response<ProxyBody>, hyper::Error> {
    debug!("Proxying request: {} {}", req.method(), req.uri());

    if req.method() == Method::CONNECT {
        Ok(handle_connect(req, dialer).await)
    } else {
        Ok(handle_forward(req, dialer).await)
    }
}

/// 处理 CONNECT：拨号、回 200、升级后转发
async fn handle_connect(req: Request<Incoming>, dialer: Arc<Dialer>) -> Response<ProxyBody> {
    // 目标不合法与拨号失败一样回 503
    let target = match connect_target(req.uri()) {
        Ok(target) => target,
        Err(e) => {
            warn!("CONNECT target is not host:port: {:?}", req.uri());
            return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        }
    };

    let remote = match dialer.dial(&target).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("{}", e);
            return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                info!("HTTP CONNECT tunnel established to {}", target);
                let (up, down) = relay(TokioIo::new(upgraded), remote).await;
                info!("HTTP CONNECT to {} closed: ↑ {} bytes, ↓ {} bytes", target, up, down);
            }
            Err(e) => {
                let err = Error::HijackUnsupported(e.to_string());
                warn!("HTTP CONNECT to {} aborted: {}", target, err);
            }
        }
    });

    Response::new(empty())
}

/// 普通 HTTP 请求：单次请求/响应转发
async fn handle_forward(req: Request<Incoming>, dialer: Arc<Dialer>) -> Response<ProxyBody> {
    let (upstream, req) = match into_origin_request(req) {
        Ok(parts) => parts,
        Err(e) => {
            warn!("Cannot forward request: {}", e);
            return error_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    match forward(&upstream, req, &dialer).await {
        Ok(resp) => resp.map(|body| body.boxed()),
        Err(e) => {
            warn!("Forward to {} failed: {}", upstream.target, e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
    }
}

/// 普通请求的上游
#[derive(Debug, PartialEq, Eq)]
struct Upstream {
    target: TargetAddr,
    /// `https` 时为 TLS 服务器名
    tls_host: Option<String>,
}

async fn forward(
    upstream: &Upstream,
    req: Request<Incoming>,
    dialer: &Dialer,
) -> Result<Response<Incoming>> {
    let stream: TcpStream = dialer.dial(&upstream.target).await?;
    let target_name = upstream.target.to_string();

    match &upstream.tls_host {
        Some(host) => {
            let stream = connect_tls(stream, host).await?;
            send_request(stream, req, target_name).await
        }
        None => send_request(stream, req, target_name).await,
    }
}

/// 在一条新的上游连接上发送单个请求
async fn send_request<T>(
    io: T,
    req: Request<Incoming>,
    target_name: String,
) -> Result<Response<Incoming>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = client_http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(io))
        .await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection to {} ended: {}", target_name, e);
        }
    });

    Ok(sender.send_request(req).await?)
}

/// CONNECT 的目标取自请求的 authority
fn connect_target(uri: &Uri) -> Result<TargetAddr> {
    let authority = uri
        .authority()
        .ok_or_else(|| Error::Protocol("CONNECT must be to a socket address".into()))?;
    let (host, port) = split_host_port(authority.as_str(), None)?;
    Ok(TargetAddr::from_host_port(&host, port))
}

/// 从绝对 URI 取出上游，并把请求行改写为 origin-form
fn into_origin_request<B>(mut req: Request<B>) -> Result<(Upstream, Request<B>)> {
    let uri = req.uri().clone();
    let upstream = upstream_of(&uri)?;

    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::from(path);

    if let Some(authority) = uri.authority() {
        if !req.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(authority.as_str())
                .map_err(|e| Error::Protocol(format!("invalid host {}: {}", authority, e)))?;
            req.headers_mut().insert(HOST, host);
        }
    }

    Ok((upstream, req))
}

/// 只接受 http / https 绝对 URI
fn upstream_of(uri: &Uri) -> Result<Upstream> {
    let authority = uri
        .authority()
        .ok_or_else(|| Error::Protocol(format!("request target must be an absolute URI: {}", uri)))?;

    let (default_port, tls) = match uri.scheme_str() {
        Some("http") => (80, false),
        Some("https") => (443, true),
        Some(other) => return Err(Error::Protocol(format!("unsupported scheme: {}", other))),
        None => {
            return Err(Error::Protocol(format!(
                "request target must be an absolute URI: {}",
                uri
            )))
        }
    };

    let (host, port) = split_host_port(authority.as_str(), Some(default_port))?;
    let target = TargetAddr::from_host_port(&host, port);
    let tls_host = tls.then_some(host);

    Ok(Upstream { target, tls_host })
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// 纯文本错误响应，正文为错误描述
fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full(format!("{}\n", message)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
