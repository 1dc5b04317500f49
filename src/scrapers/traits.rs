use anyhow::Result;
use std::time::Duration;

/// Low-level control over one browser page.
///
/// This is the only seam between the search pipeline and a real browser.
/// [`ChromeDriver`](super::ChromeDriver) drives Chrome; the scripted driver
/// serves canned pages so the engine can be exercised without one.
///
/// Methods are blocking and fail with the driver's own error. Retrying,
/// pacing and cancellation are handled one level up by
/// [`BrowserSession`](super::BrowserSession).
pub trait BrowserDriver: Send {
    /// Navigate and wait for the load to finish.
    fn goto(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Wait until `selector` matches an element.
    fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<()>;

    fn click(&mut self, selector: &str) -> Result<()>;

    /// Click the first element matching `selector` whose text contains
    /// `text`, ignoring case.
    fn click_text(&mut self, selector: &str, text: &str) -> Result<()>;

    /// Replace the value of an input.
    fn fill(&mut self, selector: &str, value: &str) -> Result<()>;

    /// Press a key on the focused element (`"Enter"`, `"PageDown"`, ...).
    fn press_key(&mut self, key: &str) -> Result<()>;

    fn focus(&mut self, selector: &str) -> Result<()>;

    fn is_checked(&mut self, selector: &str) -> Result<bool>;

    fn attribute(&mut self, selector: &str, name: &str) -> Result<Option<String>>;

    fn scroll_by(&mut self, pixels: i64) -> Result<()>;

    /// Serialized DOM of the current page.
    fn content(&mut self) -> Result<String>;

    fn current_url(&mut self) -> Result<String>;

    /// Throw away the page context and start from a fresh one.
    fn reset(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}
