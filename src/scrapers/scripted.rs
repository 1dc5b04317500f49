//! A [`BrowserDriver`] that plays back canned HTML.
//!
//! Used to exercise sessions and the search engine without Chrome. It
//! understands just enough to make a search flow work: a submit selector
//! that opens the first result page, a next selector that advances, and
//! checkbox and range-slider state.

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::BrowserDriver;

const BASE: &str = "https://scripted.test";

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<String>,
    sliders: HashMap<String, u64>,
}

/// Shared record of what a [`ScriptedDriver`] was asked to do.
///
/// Cloneable so a test can keep a handle after the driver moves into a
/// session.
#[derive(Debug, Clone, Default)]
pub struct ActionLog(Arc<Mutex<LogState>>);

impl ActionLog {
    fn state(&self) -> MutexGuard<'_, LogState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, entry: String) {
        self.state().entries.push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.state().entries.clone()
    }

    /// How many entries equal `entry` exactly.
    pub fn count(&self, entry: &str) -> usize {
        self.state().entries.iter().filter(|e| *e == entry).count()
    }

    pub fn slider_value(&self, selector: &str) -> Option<u64> {
        self.state().sliders.get(selector).copied()
    }
}

#[derive(Debug, Clone)]
struct Slider {
    min: u64,
    max: u64,
    value: u64,
    page_step: u64,
    arrow_step: u64,
}

impl Slider {
    fn press(&mut self, key: &str) {
        self.value = match key {
            "Home" => self.min,
            "End" => self.max,
            "PageUp" => self.value.saturating_add(self.page_step),
            "PageDown" => self.value.saturating_sub(self.page_step),
            "ArrowRight" | "ArrowUp" => self.value.saturating_add(self.arrow_step),
            "ArrowLeft" | "ArrowDown" => self.value.saturating_sub(self.arrow_step),
            _ => self.value,
        }
        .clamp(self.min, self.max);
    }
}

#[derive(Debug)]
pub struct ScriptedDriver {
    form_html: String,
    pages: Vec<String>,
    current: Option<usize>,
    url: String,
    submit_selector: Option<String>,
    next_selector: Option<String>,
    failing_gotos: u32,
    challenged_loads: u32,
    challenge_html: String,
    challenge_first_result: bool,
    showing_challenge: bool,
    missing: HashSet<String>,
    checked: HashSet<String>,
    sliders: HashMap<String, Slider>,
    focused: Option<String>,
    log: ActionLog,
}

impl ScriptedDriver {
    /// `pages` are the result pages, in order.
    pub fn new(pages: Vec<String>) -> Self {
        Self {
            form_html: "<html><body><form id=\"search\"></form></body></html>".to_string(),
            pages,
            current: None,
            url: "about:blank".to_string(),
            submit_selector: None,
            next_selector: None,
            failing_gotos: 0,
            challenged_loads: 0,
            challenge_html: String::new(),
            challenge_first_result: false,
            showing_challenge: false,
            missing: HashSet::new(),
            checked: HashSet::new(),
            sliders: HashMap::new(),
            focused: None,
            log: ActionLog::default(),
        }
    }

    /// URL the scripted driver reports for result page `index` (1-based).
    pub fn page_url(index: usize) -> String {
        format!("{BASE}/results?page={index}")
    }

    pub fn log(&self) -> ActionLog {
        self.log.clone()
    }

    /// Clicking `selector` shows the first result page.
    pub fn submit_on(mut self, selector: &str) -> Self {
        self.submit_selector = Some(selector.to_string());
        self
    }

    /// Clicking `selector` advances to the next result page.
    pub fn next_on(mut self, selector: &str) -> Self {
        self.next_selector = Some(selector.to_string());
        self
    }

    /// The first `n` navigations time out.
    pub fn failing_gotos(mut self, n: u32) -> Self {
        self.failing_gotos = n;
        self
    }

    /// The first `n` navigations land on `html` instead of the real page.
    pub fn challenged_loads(mut self, n: u32, html: &str) -> Self {
        self.challenged_loads = n;
        self.challenge_html = html.to_string();
        self
    }

    /// The first result page reached by a click shows `html` until it is
    /// reloaded.
    pub fn challenged_results(mut self, html: &str) -> Self {
        self.challenge_first_result = true;
        self.challenge_html = html.to_string();
        self
    }

    /// `selector` never appears.
    pub fn missing(mut self, selector: &str) -> Self {
        self.missing.insert(selector.to_string());
        self
    }

    pub fn checked(mut self, selectors: &[&str]) -> Self {
        self.checked.extend(selectors.iter().map(|s| s.to_string()));
        self
    }

    pub fn slider(mut self, selector: &str, min: u64, max: u64, page_step: u64, arrow_step: u64) -> Self {
        self.sliders.insert(
            selector.to_string(),
            Slider {
                min,
                max,
                value: min,
                page_step,
                arrow_step,
            },
        );
        self
    }

    fn require(&self, selector: &str) -> Result<()> {
        if self.missing.contains(selector) {
            bail!("`{selector}` not found");
        }
        Ok(())
    }

    fn show_page(&mut self, index: usize) {
        self.current = Some(index);
        self.url = Self::page_url(index + 1);
    }
}

impl BrowserDriver for ScriptedDriver {
    fn goto(&mut self, url: &str, _timeout: Duration) -> Result<()> {
        self.log.push(format!("goto {url}"));
        if self.failing_gotos > 0 {
            self.failing_gotos -= 1;
            bail!("navigation to {url} timed out");
        }
        self.showing_challenge = self.challenged_loads > 0;
        self.challenged_loads = self.challenged_loads.saturating_sub(1);
        match (1..=self.pages.len()).find(|i| Self::page_url(*i) == url) {
            Some(index) => self.show_page(index - 1),
            None => {
                self.current = None;
                self.url = url.to_string();
            }
        }
        Ok(())
    }

    fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<()> {
        self.log.push(format!("wait {selector}"));
        self.require(selector)
    }

    fn click(&mut self, selector: &str) -> Result<()> {
        self.log.push(format!("click {selector}"));
        self.require(selector)?;
        if self.submit_selector.as_deref() == Some(selector) {
            if self.pages.is_empty() {
                bail!("no result pages scripted");
            }
            self.show_page(0);
            self.showing_challenge = std::mem::take(&mut self.challenge_first_result);
        } else if self.next_selector.as_deref() == Some(selector) {
            let next = self.current.map_or(0, |i| i + 1);
            if next >= self.pages.len() {
                bail!("no page after {}", self.url);
            }
            self.show_page(next);
            self.showing_challenge = std::mem::take(&mut self.challenge_first_result);
        } else if !self.checked.remove(selector) {
            self.checked.insert(selector.to_string());
        }
        Ok(())
    }

    fn click_text(&mut self, selector: &str, text: &str) -> Result<()> {
        self.log.push(format!("click {selector} \"{text}\""));
        self.require(selector)
    }

    fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        self.log.push(format!("fill {selector}={value}"));
        self.require(selector)
    }

    fn press_key(&mut self, key: &str) -> Result<()> {
        self.log.push(format!("press {key}"));
        if let Some(focused) = self.focused.clone() {
            if let Some(slider) = self.sliders.get_mut(&focused) {
                slider.press(key);
                let value = slider.value;
                self.log.state().sliders.insert(focused, value);
            }
        }
        Ok(())
    }

    fn focus(&mut self, selector: &str) -> Result<()> {
        self.log.push(format!("focus {selector}"));
        self.require(selector)?;
        self.focused = Some(selector.to_string());
        Ok(())
    }

    fn is_checked(&mut self, selector: &str) -> Result<bool> {
        self.require(selector)?;
        Ok(self.checked.contains(selector))
    }

    fn attribute(&mut self, selector: &str, name: &str) -> Result<Option<String>> {
        self.require(selector)?;
        Ok(match (name, self.sliders.get(selector)) {
            ("aria-valuenow", Some(slider)) => Some(slider.value.to_string()),
            _ => None,
        })
    }

    fn scroll_by(&mut self, pixels: i64) -> Result<()> {
        self.log.push(format!("scroll {pixels}"));
        Ok(())
    }

    fn content(&mut self) -> Result<String> {
        if self.showing_challenge {
            return Ok(self.challenge_html.clone());
        }
        Ok(match self.current {
            Some(i) => self.pages[i].clone(),
            None => self.form_html.clone(),
        })
    }

    fn current_url(&mut self) -> Result<String> {
        Ok(self.url.clone())
    }

    fn reset(&mut self) -> Result<()> {
        self.log.push("reset".to_string());
        self.current = None;
        self.showing_challenge = false;
        self.focused = None;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.log.push("close".to_string());
        Ok(())
    }
}
