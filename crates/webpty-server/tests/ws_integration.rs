use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct ServerProcess {
    child: Child,
}

impl ServerProcess {
    fn spawn(listen: &str, extra: &[&str], command: &[&str]) -> Result<Self> {
        let (address, port) = listen.split_once(':').context("bad listen address")?;
        let child = Command::new(assert_cmd::cargo::cargo_bin!("webpty-server"))
            .arg("--address")
            .arg(address)
            .arg("--port")
            .arg(port)
            .args(extra)
            .args(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn webpty-server")?;
        Ok(Self { child })
    }

    async fn wait_ready(&mut self, addr: &str) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.child.try_wait()?.is_some() {
                bail!("webpty-server exited before becoming ready");
            }
            if TcpStream::connect(addr).is_ok() {
                return Ok(());
            }
            if start.elapsed() > Duration::from_secs(5) {
                bail!("timed out waiting for webpty-server listener");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn reserve_local_addr() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to bind probe listener")?;
    let addr = listener.local_addr().context("failed to read probe addr")?;
    drop(listener);
    Ok(addr.to_string())
}

async fn next_text(ws: &mut Ws) -> Result<String> {
    timeout(Duration::from_secs(5), async {
        loop {
            let Some(msg) = ws.next().await else {
                bail!("websocket closed");
            };
            if let Message::Text(text) = msg? {
                return Ok(text.to_string());
            }
        }
    })
    .await
    .context("timed out waiting for websocket message")?
}

#[tokio::test]
async fn echo_session_handshakes_and_round_trips_input() -> Result<()> {
    let listen = reserve_local_addr()?;
    let mut server = ServerProcess::spawn(&listen, &["--permit-write"], &["cat"])?;
    server.wait_ready(&listen).await?;

    let (mut ws, _) = connect_async(format!("ws://{listen}/ws")).await?;
    ws.send(Message::text(r#"{"AuthToken":""}"#)).await?;

    // Fixed handshake order: title, preferences, buffer size.
    let title = next_text(&mut ws).await?;
    assert!(title.starts_with('3'), "expected title first, got: {title}");
    let prefs = next_text(&mut ws).await?;
    assert!(prefs.starts_with('4'), "expected preferences, got: {prefs}");
    let bufsize = next_text(&mut ws).await?;
    assert!(bufsize.starts_with('6'), "expected buffer size, got: {bufsize}");

    ws.send(Message::text(format!("1{}", BASE64.encode("hello\n"))))
        .await?;

    let mut echoed = Vec::new();
    let found = timeout(Duration::from_secs(5), async {
        loop {
            let text = next_text(&mut ws).await?;
            if let Some(payload) = text.strip_prefix('1') {
                echoed.extend_from_slice(&BASE64.decode(payload)?);
                if String::from_utf8_lossy(&echoed).contains("hello") {
                    return Ok::<bool, anyhow::Error>(true);
                }
            }
        }
    })
    .await
    .context("timed out waiting for echo")??;
    assert!(found);

    let _ = ws.close(None).await;
    Ok(())
}

#[tokio::test]
async fn wrong_auth_token_closes_the_session_before_any_output() -> Result<()> {
    let listen = reserve_local_addr()?;
    let mut server = ServerProcess::spawn(&listen, &["--credential", "admin:secret"], &["cat"])?;
    server.wait_ready(&listen).await?;

    // Basic auth guards the upgrade; the init token is checked in-band.
    let mut request = format!("ws://{listen}/ws").into_client_request()?;
    request.headers_mut().insert(
        "authorization",
        format!("Basic {}", BASE64.encode("admin:secret")).parse()?,
    );
    let (mut ws, _) = connect_async(request).await?;

    ws.send(Message::text(r#"{"AuthToken":"wrong"}"#)).await?;

    let outcome = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) => return Ok::<_, anyhow::Error>(None),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .context("timed out waiting for rejection")??;

    assert!(
        outcome.is_none(),
        "server sent a message to an unauthenticated client: {outcome:?}"
    );
    Ok(())
}

#[tokio::test]
async fn upgrade_without_credentials_is_unauthorized() -> Result<()> {
    let listen = reserve_local_addr()?;
    let mut server = ServerProcess::spawn(&listen, &["--credential", "admin:secret"], &["cat"])?;
    server.wait_ready(&listen).await?;

    let err = connect_async(format!("ws://{listen}/ws")).await.err();
    assert!(err.is_some(), "upgrade should fail without basic auth");
    Ok(())
}

#[tokio::test]
async fn repeated_auth_failures_are_locked_out_with_retry_after() -> Result<()> {
    let listen = reserve_local_addr()?;
    let mut server = ServerProcess::spawn(&listen, &["--credential", "admin:secret"], &["cat"])?;
    server.wait_ready(&listen).await?;

    // Failed attempts count whether or not a credential was supplied.
    for attempt in 0..5 {
        let credential = if attempt % 2 == 0 {
            Some("wrong:creds")
        } else {
            None
        };
        let (status, _) = http_get(&listen, "/", credential)?;
        assert_eq!(status, 401, "attempt {attempt} should be unauthorized");
    }

    // The sixth attempt trips the per-IP lockout regardless of credentials.
    let (status, headers) = http_get(&listen, "/", Some("admin:secret"))?;
    assert_eq!(status, 429);
    let retry_after: u64 = headers
        .get("retry-after")
        .context("missing Retry-After header")?
        .parse()?;
    assert!(retry_after >= 1);
    Ok(())
}

#[tokio::test]
async fn connection_limit_refuses_the_upgrade() -> Result<()> {
    let listen = reserve_local_addr()?;
    let mut server = ServerProcess::spawn(&listen, &["--max-connections", "1"], &["cat"])?;
    server.wait_ready(&listen).await?;

    // Fill the single slot and wait for the handshake so the session is
    // established server-side.
    let (mut ws, _) = connect_async(format!("ws://{listen}/ws")).await?;
    ws.send(Message::text(r#"{"AuthToken":""}"#)).await?;
    let title = next_text(&mut ws).await?;
    assert!(title.starts_with('3'), "expected title, got: {title}");

    // The second client is refused before the upgrade completes.
    match connect_async(format!("ws://{listen}/ws")).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 429);
        }
        Ok(_) => bail!("second connection should have been refused"),
        Err(other) => bail!("expected an HTTP rejection, got: {other}"),
    }

    let _ = ws.close(None).await;
    Ok(())
}

#[tokio::test]
async fn successful_auth_serves_the_token_script() -> Result<()> {
    let listen = reserve_local_addr()?;
    let mut server = ServerProcess::spawn(&listen, &["--credential", "admin:secret"], &["cat"])?;
    server.wait_ready(&listen).await?;

    let (status, _) = http_get(&listen, "/auth_token.js", Some("admin:secret"))?;
    assert_eq!(status, 200);

    let (status, _) = http_get(&listen, "/auth_token.js", None)?;
    assert_eq!(status, 401);
    Ok(())
}

fn http_get(
    addr: &str,
    path: &str,
    credential: Option<&str>,
) -> Result<(u16, HashMap<String, String>)> {
    let mut stream = TcpStream::connect(addr).context("connect failed")?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    if let Some(credential) = credential {
        request.push_str(&format!(
            "Authorization: Basic {}\r\n",
            BASE64.encode(credential)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes())?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;

    let mut lines = response.lines();
    let status_line = lines.next().context("empty response")?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .context("malformed status line")?
        .parse()?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok((status, headers))
}
