pub mod browser;
pub mod engine;
#[cfg(test)]
pub(crate) mod scripted;
pub mod session;
pub mod stealth;
pub mod traits;
pub mod types;

pub use browser::ChromeDriver;
pub use engine::{plan_form, search_with_chrome, EngineSettings, SearchEngine, SearchOutcome, SearchState};
pub use session::{BrowserSession, SessionPolicy};
pub use traits::BrowserDriver;
pub use types::{BrowserEngine, BrowserOptions, SearchCriteria, SearchMode};
