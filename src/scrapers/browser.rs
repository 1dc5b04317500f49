use anyhow::{anyhow, bail, Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::stealth;
use super::traits::BrowserDriver;
use super::types::{BrowserEngine, BrowserOptions};

/// Chrome is killed by headless_chrome when no command reaches it for this
/// long. Slow form steps must stay well under it.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(300);

/// [`BrowserDriver`] backed by a real Chrome through headless_chrome
pub struct ChromeDriver {
    browser: Browser,
    tab: Arc<Tab>,
    options: BrowserOptions,
}

impl ChromeDriver {
    /// Launch Chrome. `options` should already be
    /// [`resolved`](BrowserOptions::resolved).
    pub fn launch(options: &BrowserOptions) -> Result<Self> {
        info!(
            headless = options.headless,
            engine = ?options.engine,
            "Launching Chrome..."
        );

        let args = stealth::launch_args(options);
        // `--headless=new` is passed as a raw flag, so headless_chrome must
        // not add its own `--headless`.
        let classic_headless = options.headless && options.engine == BrowserEngine::Chrome;

        let launch = LaunchOptions {
            headless: classic_headless,
            window_size: Some((options.window_width, options.window_height)),
            path: options.chrome_path.clone(),
            args: args.iter().map(OsStr::new).collect(),
            idle_browser_timeout: IDLE_BROWSER_TIMEOUT,
            ..Default::default()
        };

        let browser = Browser::new(launch).context("Failed to launch Chrome browser")?;
        let tab = Self::prepare_tab(&browser, options)?;

        Ok(Self {
            browser,
            tab,
            options: options.clone(),
        })
    }

    fn prepare_tab(browser: &Browser, options: &BrowserOptions) -> Result<Arc<Tab>> {
        let tab = browser.new_tab().context("Failed to open tab")?;
        tab.set_default_timeout(options.element_timeout());
        tab.set_user_agent(
            &options.user_agent,
            Some(&options.accept_language),
            Some(&options.platform),
        )?;

        if options.stealth {
            tab.enable_stealth_mode()?;
            debug!("Stealth mode enabled");
        }
        Ok(tab)
    }

    /// Evaluate a script and return its value, if any.
    fn eval(&self, script: &str) -> Result<Option<Value>> {
        let result = self.tab.evaluate(script, false)?;
        Ok(result.value)
    }

    /// Evaluate a script that reports success as a boolean.
    fn eval_flag(&self, script: &str, what: &str) -> Result<bool> {
        match self.eval(script)? {
            Some(Value::Bool(flag)) => Ok(flag),
            other => bail!("{what}: unexpected script result {other:?}"),
        }
    }
}

/// JSON-quote a value for interpolation into a script.
fn js(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

impl BrowserDriver for ChromeDriver {
    fn goto(&mut self, url: &str, timeout: Duration) -> Result<()> {
        self.tab.set_default_timeout(timeout);
        let navigated = self
            .tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated().map(|_| ()));
        self.tab.set_default_timeout(self.options.element_timeout());
        navigated.with_context(|| format!("navigation to {url} failed"))?;

        // Re-applied after every load; page scripts that ran first saw the
        // unpatched navigator.
        if self.options.stealth {
            if let Err(e) = self.eval(&stealth::patch_script(&self.options)) {
                debug!("Fingerprint patch failed: {e:#}");
            }
        }
        Ok(())
    }

    fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<()> {
        self.tab
            .wait_for_element_with_custom_timeout(selector, timeout)
            .with_context(|| format!("`{selector}` did not appear within {timeout:?}"))?;
        Ok(())
    }

    fn click(&mut self, selector: &str) -> Result<()> {
        let element = self
            .tab
            .wait_for_element(selector)
            .with_context(|| format!("`{selector}` not found"))?;
        element.click()?;
        Ok(())
    }

    fn click_text(&mut self, selector: &str, text: &str) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const wanted = {text}.toLowerCase();
                const el = Array.from(document.querySelectorAll({selector}))
                    .find(e => (e.textContent || '').toLowerCase().includes(wanted));
                if (!el) {{ return false; }}
                el.click();
                return true;
            }})()"#,
            text = js(text),
            selector = js(selector),
        );
        if !self.eval_flag(&script, "click_text")? {
            bail!("no `{selector}` containing \"{text}\"");
        }
        Ok(())
    }

    fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        let element = self
            .tab
            .wait_for_element(selector)
            .with_context(|| format!("`{selector}` not found"))?;
        element.click()?;
        let clear = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; el.value = ''; return true; }})()",
            js(selector)
        );
        self.eval_flag(&clear, "fill")?;
        element.type_into(value)?;
        Ok(())
    }

    fn press_key(&mut self, key: &str) -> Result<()> {
        self.tab.press_key(key)?;
        Ok(())
    }

    fn focus(&mut self, selector: &str) -> Result<()> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; el.focus(); return true; }})()",
            js(selector)
        );
        if !self.eval_flag(&script, "focus")? {
            bail!("`{selector}` not found");
        }
        Ok(())
    }

    fn is_checked(&mut self, selector: &str) -> Result<bool> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); return el ? !!el.checked : null; }})()",
            js(selector)
        );
        match self.eval(&script)? {
            Some(Value::Bool(checked)) => Ok(checked),
            _ => Err(anyhow!("`{selector}` not found")),
        }
    }

    fn attribute(&mut self, selector: &str, name: &str) -> Result<Option<String>> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.getAttribute({}) : null; }})()",
            js(selector),
            js(name)
        );
        Ok(match self.eval(&script)? {
            Some(Value::String(value)) => Some(value),
            _ => None,
        })
    }

    fn scroll_by(&mut self, pixels: i64) -> Result<()> {
        self.eval(&format!("window.scrollBy(0, {pixels})"))?;
        Ok(())
    }

    fn content(&mut self) -> Result<String> {
        self.tab.get_content().context("Failed to read page HTML")
    }

    fn current_url(&mut self) -> Result<String> {
        Ok(self.tab.get_url())
    }

    fn reset(&mut self) -> Result<()> {
        warn!("Resetting browser tab");
        if let Err(e) = self.tab.close(false) {
            debug!("Closing old tab failed: {e:#}");
        }
        self.tab = Self::prepare_tab(&self.browser, &self.options)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.tab.close(false).context("Failed to close tab")?;
        info!("Browser session closed");
        Ok(())
    }
}
