//! Short-lived LAN share: publishes one piece of text (usually a setup
//! script) at a random URL until it expires or is replaced.

use crate::error::SyncEngineError;
use crate::models::{now_ms, ShareStartResult};
use std::net::{IpAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_SHARE_PORT: u16 = 47615;
pub const DEFAULT_SHARE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
struct ShareSession {
    token: String,
    content: String,
    created_at_ms: u64,
    expires_at_ms: u64,
}

type SharedSession = Arc<Mutex<Option<ShareSession>>>;

fn lock(session: &SharedSession) -> MutexGuard<'_, Option<ShareSession>> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Listener {
    server: Arc<Server>,
    port: u16,
    worker: Option<JoinHandle<()>>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Binds on the first `start` and keeps the socket for the life of the
/// value; at most one session is served at a time.
pub struct ShareServer {
    port: u16,
    ttl: Duration,
    session: SharedSession,
    listener: Mutex<Option<Listener>>,
}

impl std::fmt::Debug for ShareServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareServer")
            .field("port", &self.port)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Default for ShareServer {
    fn default() -> Self {
        Self::new(DEFAULT_SHARE_PORT, DEFAULT_SHARE_TTL)
    }
}

impl ShareServer {
    /// Port `0` binds an ephemeral port.
    pub fn new(port: u16, ttl: Duration) -> Self {
        Self {
            port,
            ttl,
            session: Arc::new(Mutex::new(None)),
            listener: Mutex::new(None),
        }
    }

    pub fn start(&self, content: &str) -> Result<ShareStartResult, SyncEngineError> {
        if content.trim().is_empty() {
            return Err(SyncEngineError::ShareContentEmpty);
        }

        let port = self.ensure_listener()?;
        let created_at_ms = now_ms();
        let expires_at_ms = created_at_ms.saturating_add(self.ttl.as_millis() as u64);
        let token = Uuid::new_v4().simple().to_string();

        *lock(&self.session) = Some(ShareSession {
            token: token.clone(),
            content: content.to_string(),
            created_at_ms,
            expires_at_ms,
        });

        let local_base = format!("http://localhost:{port}/s/{token}");
        let lan_base = lan_address().map(|ip| format!("http://{ip}:{port}/s/{token}"));
        info!(port, lan = lan_base.is_some(), "share session started");

        Ok(ShareStartResult {
            local_raw_url: format!("{local_base}/raw"),
            local_url: local_base,
            lan_raw_url: lan_base.as_ref().map(|base| format!("{base}/raw")),
            lan_url: lan_base,
            expires_at_ms,
        })
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|listener| listener.port)
    }

    fn ensure_listener(&self) -> Result<u16, SyncEngineError> {
        let mut guard = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = guard.as_ref() {
            return Ok(listener.port);
        }

        let server = Server::http(("0.0.0.0", self.port))
            .map_err(|e| SyncEngineError::ShareServerFailed(e.to_string()))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| {
                SyncEngineError::ShareServerFailed(String::from("listener has no IP address"))
            })?;

        let server = Arc::new(server);
        let worker_server = Arc::clone(&server);
        let session = Arc::clone(&self.session);
        let worker = std::thread::Builder::new()
            .name(String::from("agentsync-share"))
            .spawn(move || {
                for request in worker_server.incoming_requests() {
                    serve(request, &session);
                }
            })
            .map_err(|e| SyncEngineError::ShareServerFailed(e.to_string()))?;

        *guard = Some(Listener {
            server,
            port,
            worker: Some(worker),
        });
        Ok(port)
    }
}

fn serve(request: Request, session: &SharedSession) {
    let path = request
        .url()
        .split('?')
        .next()
        .unwrap_or_default()
        .to_string();
    debug!(method = %request.method(), %path, "share request");

    if request.method() != &Method::Get {
        respond(request, Response::from_string("method not allowed").with_status_code(StatusCode(405)));
        return;
    }

    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    let (token, raw) = match parts.as_slice() {
        ["s", token] => (*token, false),
        ["s", token, "raw"] => (*token, true),
        _ => {
            respond(request, not_found());
            return;
        }
    };

    let current = lock(session).clone();
    let Some(current) = current.filter(|current| current.token == token) else {
        respond(request, not_found());
        return;
    };

    if now_ms() >= current.expires_at_ms {
        respond(
            request,
            Response::from_string("this share link has expired").with_status_code(StatusCode(410)),
        );
        return;
    }

    let response = if raw {
        with_content_type(
            Response::from_string(current.content),
            "text/plain; charset=utf-8",
        )
    } else {
        with_content_type(
            Response::from_string(html_page(&current)),
            "text/html; charset=utf-8",
        )
    };
    respond(request, response);
}

fn not_found() -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string("not found").with_status_code(StatusCode(404))
}

fn with_content_type(
    response: Response<std::io::Cursor<Vec<u8>>>,
    value: &str,
) -> Response<std::io::Cursor<Vec<u8>>> {
    match Header::from_bytes(&b"Content-Type"[..], value.as_bytes()) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

fn respond(request: Request, response: Response<std::io::Cursor<Vec<u8>>>) {
    if let Err(error) = request.respond(response) {
        warn!(%error, "failed to answer share request");
    }
}

fn html_page(session: &ShareSession) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>AgentSync share</title>
    <style>
      body {{ margin: 0; font-family: system-ui, sans-serif; background: #f5f3ff; color: #0f172a; }}
      main {{ max-width: 760px; margin: 0 auto; padding: 28px 16px; }}
      textarea {{ width: 100%; min-height: 240px; font-family: ui-monospace, monospace; font-size: 12px; }}
      .hint {{ font-size: 12px; color: #64748b; }}
    </style>
  </head>
  <body>
    <main>
      <h1>AgentSync share</h1>
      <p class="hint">Copy the text below and run it in a terminal on this machine. Expires <span id="exp"></span>.</p>
      <textarea id="t" readonly spellcheck="false">{content}</textarea>
      <p><button onclick="copyText()">Copy</button> <span id="msg" class="hint"></span></p>
    </main>
    <script>
      document.getElementById('exp').textContent = new Date({expires_at_ms}).toLocaleString();
      async function copyText() {{
        const ta = document.getElementById('t');
        const msg = document.getElementById('msg');
        ta.focus();
        ta.select();
        try {{
          if (document.execCommand('copy')) {{ msg.textContent = 'Copied.'; return; }}
          if (navigator.clipboard) {{ await navigator.clipboard.writeText(ta.value); msg.textContent = 'Copied.'; return; }}
        }} catch (e) {{}}
        msg.textContent = 'Select the text and copy it manually.';
      }}
    </script>
    <!-- created {created_at_ms} -->
  </body>
</html>
"#,
        content = escape_html(&session.content),
        expires_at_ms = session.expires_at_ms,
        created_at_ms = session.created_at_ms,
    )
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Address of the interface that routes outwards. Connecting a UDP socket
/// sends no packets.
fn lan_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        return None;
    }
    Some(ip)
}

#[cfg(test)]
mod tests {
    use super::{escape_html, ShareServer};
    use crate::error::SyncEngineError;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn request(port: u16, method: &str, path: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        write!(
            stream,
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
        )
        .expect("write");
        let mut raw = String::new();
        stream.read_to_string(&mut raw).expect("read");
        let status = raw
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status code");
        let body = raw.split("\r\n\r\n").nth(1).unwrap_or_default().to_string();
        (status, body)
    }

    fn path_of(url: &str) -> String {
        let after_scheme = url.trim_start_matches("http://");
        let slash = after_scheme.find('/').expect("path");
        after_scheme[slash..].to_string()
    }

    #[test]
    fn serves_raw_and_html_views() {
        let server = ShareServer::new(0, Duration::from_secs(60));
        let share = server.start("echo <hi> && true").expect("start");
        let port = server.bound_port().expect("port");

        let (status, body) = request(port, "GET", &path_of(&share.local_raw_url));
        assert_eq!(status, 200);
        assert_eq!(body, "echo <hi> && true");

        let (status, body) = request(port, "GET", &path_of(&share.local_url));
        assert_eq!(status, 200);
        assert!(body.contains("echo &lt;hi&gt; &amp;&amp; true"));

        let (status, _) = request(port, "POST", &path_of(&share.local_url));
        assert_eq!(status, 405);
    }

    #[test]
    fn second_share_replaces_the_first() {
        let server = ShareServer::new(0, Duration::from_secs(60));
        let first = server.start("first").expect("first");
        let second = server.start("second").expect("second");
        let port = server.bound_port().expect("port");

        assert_eq!(request(port, "GET", &path_of(&first.local_raw_url)).0, 404);
        assert_eq!(
            request(port, "GET", &path_of(&second.local_raw_url)),
            (200, String::from("second"))
        );
    }

    #[test]
    fn expired_share_answers_gone() {
        let server = ShareServer::new(0, Duration::from_millis(0));
        let share = server.start("short lived").expect("start");
        let port = server.bound_port().expect("port");
        assert_eq!(request(port, "GET", &path_of(&share.local_raw_url)).0, 410);
    }

    #[test]
    fn blank_content_is_rejected() {
        let server = ShareServer::new(0, Duration::from_secs(60));
        assert!(matches!(
            server.start("  \n"),
            Err(SyncEngineError::ShareContentEmpty)
        ));
        assert!(server.bound_port().is_none());
    }

    #[test]
    fn html_escaping_covers_markup() {
        assert_eq!(escape_html(r#"<a href="x">&</a>"#), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }
}
