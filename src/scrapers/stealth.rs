//! Anti-detection measures: launch flags, fingerprint patches and
//! human-like pacing.
//!
//! None of this defeats a determined bot wall. It removes the most common
//! automation tells so ordinary listing pages load normally.

use rand::Rng;
use std::time::Duration;

use super::types::{BrowserEngine, BrowserOptions};

/// Chrome flags for a session.
pub fn launch_args(options: &BrowserOptions) -> Vec<String> {
    let mut args = vec![
        "--disable-blink-features=AutomationControlled".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-infobars".to_string(),
    ];
    if let Some(lang) = primary_language(&options.accept_language) {
        args.push(format!("--lang={lang}"));
    }
    if options.engine == BrowserEngine::ChromeNewHeadless && options.headless {
        args.push("--headless=new".to_string());
    }
    args
}

/// `en-AU` from `en-AU,en;q=0.9`.
fn primary_language(accept_language: &str) -> Option<&str> {
    accept_language
        .split(',')
        .next()
        .map(|l| l.split(';').next().unwrap_or(l).trim())
        .filter(|l| !l.is_empty())
}

/// Navigator patches evaluated after each page load.
pub fn patch_script(options: &BrowserOptions) -> String {
    let languages: Vec<&str> = options
        .accept_language
        .split(',')
        .filter_map(|l| l.split(';').next())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let languages = serde_json::to_string(&languages).unwrap_or_else(|_| "[\"en-AU\",\"en\"]".to_string());
    let platform = serde_json::to_string(&options.platform).unwrap_or_else(|_| "\"Win32\"".to_string());

    format!(
        r#"
        Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined, configurable: true }});
        Object.defineProperty(navigator, 'languages', {{ get: () => {languages}, configurable: true }});
        Object.defineProperty(navigator, 'platform', {{ get: () => {platform}, configurable: true }});
        Object.defineProperty(navigator, 'plugins', {{
            get: () => {{
                const plugins = [
                    {{ name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer' }},
                    {{ name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai' }},
                    {{ name: 'Native Client', filename: 'internal-nacl-plugin' }}
                ];
                plugins.item = (i) => plugins[i];
                plugins.namedItem = (name) => plugins.find(p => p.name === name);
                plugins.refresh = () => {{}};
                return plugins;
            }},
            configurable: true
        }});
        if (!window.chrome) {{ window.chrome = {{}}; }}
        if (!window.chrome.runtime) {{
            window.chrome.runtime = {{ connect: function() {{}}, sendMessage: function() {{}} }};
        }}
        const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
        if (originalQuery) {{
            window.navigator.permissions.query = (parameters) => (
                parameters.name === 'notifications'
                    ? Promise.resolve({{ state: Notification.permission }})
                    : originalQuery(parameters)
            );
        }}
        const getParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = function(parameter) {{
            if (parameter === 37445) {{ return 'Intel Inc.'; }}
            if (parameter === 37446) {{ return 'Intel Iris OpenGL Engine'; }}
            return getParameter.call(this, parameter);
        }};
        "#
    )
}

/// Randomized delays between interactions
#[derive(Debug, Clone)]
pub struct Pacer {
    min_ms: u64,
    max_ms: u64,
}

impl Pacer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
        }
    }

    pub fn from_options(options: &BrowserOptions) -> Self {
        Self::new(options.min_action_delay_ms, options.max_action_delay_ms)
    }

    /// Next pause, uniformly drawn from the configured range.
    pub fn next_delay(&self) -> Duration {
        if self.max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(self.min_ms..=self.max_ms);
        Duration::from_millis(ms)
    }
}
