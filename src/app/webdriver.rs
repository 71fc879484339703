use std::fs::{self, File};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use super::config::BrowserSettings;
use super::error::{Result, ScrapeError};
use super::surface::{ElementHandle, RenderingSurface};
use super::types::BoundingBox;

/// W3C key under which element references travel on the wire.
const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4a6cda3c1f50";

pub struct WebDriverSurface {
    client: reqwest::Client,
    endpoint: String,
    session_id: String,
}

impl WebDriverSurface {
    pub async fn connect(endpoint: &str, settings: &BrowserSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ScrapeError::Surface(format!("webdriver client build failed: {e}")))?;
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let caps = webdriver_capabilities(settings);
        let value = send_command(&client, Method::POST, &format!("{endpoint}/session"), Some(caps))
            .await
            .map_err(|e| ScrapeError::Surface(format!("session create failed: {e}")))?;
        let session_id = value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ScrapeError::Surface(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&value.to_string(), 220)
                ))
            })?
            .to_string();
        info!(%endpoint, %session_id, "browser session created");
        Ok(Self {
            client,
            endpoint,
            session_id,
        })
    }

    async fn session_command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}/session/{}{}", self.endpoint, self.session_id, path);
        send_command(&self.client, method, &url, body).await
    }

    pub async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.session_command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    fn element_path(element: &ElementHandle, rest: &str) -> String {
        format!("/element/{}{}", element.0, rest)
    }
}

#[async_trait]
impl RenderingSurface for WebDriverSurface {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        match self
            .session_command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
        {
            Ok(_) => Ok(()),
            Err(ScrapeError::Surface(msg)) if msg.starts_with("timeout") => {
                Err(ScrapeError::NavigationTimeout(url.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn find_elements(&mut self, css: &str) -> Result<Vec<ElementHandle>> {
        let value = self
            .session_command(
                Method::POST,
                "/elements",
                Some(json!({ "using": "css selector", "value": css })),
            )
            .await?;
        Ok(value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|el| el.get(ELEMENT_KEY).and_then(|id| id.as_str()))
                    .map(|id| ElementHandle(id.to_string()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default())
    }

    async fn attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        let path = Self::element_path(element, &format!("/attribute/{name}"));
        let value = self.session_command(Method::GET, &path, None).await?;
        Ok(value.as_str().map(|s| s.to_string()))
    }

    async fn text(&mut self, element: &ElementHandle) -> Result<String> {
        let path = Self::element_path(element, "/text");
        let value = self.session_command(Method::GET, &path, None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn bounding_box(&mut self, element: &ElementHandle) -> Result<BoundingBox> {
        let script = r#"
            const rect = arguments[0].getBoundingClientRect();
            return { width: rect.width, height: rect.height, top: rect.top, left: rect.left };
        "#;
        let value = self
            .execute(script, vec![json!({ ELEMENT_KEY: element.0 })])
            .await?;
        let read = |key: &str| value.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok(BoundingBox {
            width: read("width"),
            height: read("height"),
            top: read("top"),
            left: read("left"),
        })
    }

    async fn click(&mut self, element: &ElementHandle) -> Result<()> {
        let path = Self::element_path(element, "/click");
        self.session_command(Method::POST, &path, Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn scroll_height(&mut self) -> Result<i64> {
        let value = self
            .execute("return document.body.scrollHeight;", Vec::new())
            .await?;
        value
            .as_f64()
            .map(|h| h as i64)
            .ok_or_else(|| ScrapeError::Surface(format!("unexpected scroll height {value}")))
    }

    async fn scroll_to_bottom(&mut self) -> Result<()> {
        self.execute("window.scrollTo(0, document.body.scrollHeight);", Vec::new())
            .await
            .map(|_| ())
    }

    async fn user_agent(&mut self) -> Result<String> {
        let value = self.execute("return navigator.userAgent;", Vec::new()).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&mut self) -> Result<()> {
        self.session_command(Method::DELETE, "", None).await.map(|_| ())
    }
}

/// Sends one WebDriver command and unwraps the `value` member of the reply.
async fn send_command(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let res = request
        .send()
        .await
        .map_err(|e| ScrapeError::Surface(format!("request to {url} failed: {e}")))?;
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| ScrapeError::Surface(format!("response read failed: {e}")))?;
    let parsed: Value = serde_json::from_str(&body).unwrap_or_default();
    if let Some(err) = parsed.pointer("/value/error").and_then(|v| v.as_str()) {
        let message = parsed
            .pointer("/value/message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown webdriver error");
        return Err(ScrapeError::Surface(format!(
            "{err}: {}",
            truncate_for_log(message, 240)
        )));
    }
    if !status.is_success() {
        return Err(ScrapeError::Surface(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(&body, 240)
        )));
    }
    Ok(parsed.get("value").cloned().unwrap_or(Value::Null))
}

fn webdriver_capabilities(settings: &BrowserSettings) -> Value {
    let mut args = vec![
        "-profile".to_string(),
        settings.profile_dir.to_string_lossy().to_string(),
        "--width=1920".to_string(),
        "--height=1080".to_string(),
    ];
    if settings.headless {
        args.push("-headless".to_string());
    }
    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "firefox",
                "acceptInsecureCerts": true,
                "moz:firefoxOptions": { "args": args }
            }
        }
    })
}

pub(crate) fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

/// Returns a reachable endpoint, spawning a local driver when allowed.
pub async fn ensure_webdriver(settings: &BrowserSettings) -> Result<(String, Option<Child>)> {
    if settings.autostart {
        let mut endpoints = Vec::new();
        if let Ok(port) = free_loopback_port() {
            endpoints.push(format!("http://127.0.0.1:{port}"));
        }
        let requested = pin_to_loopback(&settings.webdriver_url);
        if !endpoints.contains(&requested) {
            endpoints.push(requested);
        }

        let mut last_err = String::new();
        for endpoint in endpoints {
            match start_webdriver(settings, &endpoint).await {
                Ok(child) => {
                    info!(%endpoint, "WebDriver autostarted");
                    return Ok((endpoint, Some(child)));
                }
                Err(err) => {
                    warn!(%endpoint, "WebDriver autostart failed: {err}");
                    last_err = err;
                }
            }
        }
        if driver_answers(&settings.webdriver_url) {
            return Ok((settings.webdriver_url.clone(), None));
        }
        return Err(ScrapeError::Setup(format!(
            "could not start a WebDriver server: {last_err}"
        )));
    }

    if driver_answers(&settings.webdriver_url) {
        info!(endpoint = %settings.webdriver_url, "WebDriver endpoint reachable");
        return Ok((settings.webdriver_url.clone(), None));
    }
    Err(ScrapeError::Setup(format!(
        "endpoint {} unreachable and --no-webdriver-autostart is set",
        settings.webdriver_url
    )))
}

async fn start_webdriver(settings: &BrowserSettings, endpoint: &str) -> std::result::Result<Child, String> {
    let (host, port) =
        host_and_port(endpoint).ok_or_else(|| format!("invalid webdriver url: {endpoint}"))?;
    if host != "localhost" && host != "127.0.0.1" {
        return Err("autostart only supports localhost endpoints".to_string());
    }
    let binary = settings
        .webdriver_binary
        .clone()
        .unwrap_or_else(|| "geckodriver".to_string());

    let log_path = webdriver_log_path(port)?;
    let log_file = File::options()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .map_err(|e| format!("failed to open webdriver log {}: {e}", log_path.display()))?;
    let log_file_err = log_file
        .try_clone()
        .map_err(|e| format!("failed to clone webdriver log handle: {e}"))?;

    let mut child = Command::new(&binary)
        .arg("--port")
        .arg(port.to_string())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| format!("failed to spawn {binary}: {e}"))?;

    let steps = (settings.start_timeout.as_millis() / 200).max(1);
    for _ in 0..steps {
        if driver_answers(endpoint) {
            return Ok(child);
        }
        if let Ok(Some(status)) = child.try_wait() {
            let mut err = format!(
                "{binary} exited early with status {status} (log: {})",
                log_path.display()
            );
            if let Some(tail) = log_tail(&log_path, 30) {
                err = format!("{err}; tail: {tail}");
            }
            return Err(err);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = child.kill();
    let _ = child.wait();
    let mut err = format!(
        "{binary} did not become ready in time (log: {})",
        log_path.display()
    );
    if let Some(tail) = log_tail(&log_path, 30) {
        err = format!("{err}; tail: {tail}");
    }
    Err(err)
}

pub fn stop_webdriver(mut child: Option<Child>) {
    if let Some(ref mut c) = child {
        debug!(pid = c.id(), "stopping WebDriver process");
        let _ = c.kill();
        let _ = c.wait();
    }
}

/// Host and port of an endpoint URL, defaulting the port to geckodriver's.
fn host_and_port(endpoint: &str) -> Option<(String, u16)> {
    let url = Url::parse(endpoint).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some((host, url.port_or_known_default().unwrap_or(4444)))
}

fn driver_answers(endpoint: &str) -> bool {
    host_and_port(endpoint)
        .and_then(|(host, port)| (host.as_str(), port).to_socket_addrs().ok())
        .is_some_and(|mut addrs| {
            addrs.any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
        })
}

/// `localhost` endpoints are rewritten to `127.0.0.1` so the driver binds IPv4.
fn pin_to_loopback(endpoint: &str) -> String {
    match (Url::parse(endpoint), host_and_port(endpoint)) {
        (Ok(url), Some((host, port))) if host == "localhost" || host == "127.0.0.1" => {
            format!("{}://127.0.0.1:{port}", url.scheme())
        }
        _ => endpoint.to_string(),
    }
}

fn webdriver_log_path(port: u16) -> std::result::Result<PathBuf, String> {
    let dir = std::env::temp_dir().join("postgrab");
    fs::create_dir_all(&dir).map_err(|e| format!("log dir create failed: {e}"))?;
    Ok(dir.join(format!("webdriver-{port}.log")))
}

fn log_tail(path: &Path, count: usize) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let all = text.lines().collect::<Vec<_>>();
    let kept = &all[all.len().saturating_sub(count.max(1))..];
    (!kept.is_empty()).then(|| kept.join(" | "))
}

fn free_loopback_port() -> std::result::Result<u16, String> {
    TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(|e| format!("no free loopback port: {e}"))
}
