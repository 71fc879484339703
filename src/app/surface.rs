use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::error::Result;
use super::types::BoundingBox;

/// Opaque reference to an element on the current page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub String);

/// The stateful browser page everything is driven through.
///
/// Calls are strictly sequential; `&mut self` keeps two visits from
/// interleaving on the same session.
#[async_trait]
pub trait RenderingSurface: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    async fn find_elements(&mut self, css: &str) -> Result<Vec<ElementHandle>>;

    async fn attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>>;

    async fn text(&mut self, element: &ElementHandle) -> Result<String>;

    async fn bounding_box(&mut self, element: &ElementHandle) -> Result<BoundingBox>;

    async fn click(&mut self, element: &ElementHandle) -> Result<()>;

    async fn scroll_height(&mut self) -> Result<i64>;

    async fn scroll_to_bottom(&mut self) -> Result<()>;

    async fn user_agent(&mut self) -> Result<String>;

    async fn close(&mut self) -> Result<()>;
}

/// Bounded polling window for DOM conditions.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    until: Instant,
    poll: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration, poll: Duration) -> Self {
        Self {
            until: Instant::now() + timeout,
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    /// Sleeps one poll interval. Returns `false` once the window has closed.
    pub async fn tick(&self) -> bool {
        let now = Instant::now();
        if now >= self.until {
            return false;
        }
        tokio::time::sleep(self.poll.min(self.until - now)).await;
        true
    }
}
