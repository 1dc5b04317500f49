use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stealth::Pacer;
use super::traits::BrowserDriver;
use super::types::BrowserOptions;
use crate::error::{Result, ScoutError};
use crate::models::RawPage;
use crate::retry::RetryPolicy;
use crate::sites::{find_marker, Step};

/// Slider gaps larger than this are closed with PageUp/PageDown.
const COARSE_SLIDER_GAP: u64 = 1_000_000;

/// Sleeps are cut into slices this long so cancellation lands quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Retry behaviour of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Navigation and interaction timeouts
    pub automation: RetryPolicy,
    /// Pages that turned out to be a bot challenge
    pub challenge: RetryPolicy,
    /// Open a fresh tab before retrying a challenged navigation
    pub reset_on_challenge: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            automation: RetryPolicy::default(),
            challenge: RetryPolicy {
                max_attempts: 2,
                initial_backoff_ms: 10_000,
                ..RetryPolicy::default()
            },
            reset_on_challenge: true,
        }
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("cancelled")]
    Cancelled,
    #[error("{0:#}")]
    Driver(anyhow::Error),
}

/// One browser, one page, one search run.
///
/// Every interaction goes through [`apply_steps`](Self::apply_steps) or
/// [`goto`](Self::goto), which pace, retry and watch the cancellation
/// token. The driver is closed when the session is closed or dropped.
pub struct BrowserSession<D: BrowserDriver> {
    driver: D,
    options: BrowserOptions,
    policy: SessionPolicy,
    challenge_markers: Vec<String>,
    pacer: Pacer,
    cancel: CancellationToken,
    closed: bool,
}

impl<D: BrowserDriver> BrowserSession<D> {
    pub fn open(
        driver: D,
        options: BrowserOptions,
        policy: SessionPolicy,
        challenge_markers: Vec<String>,
        cancel: CancellationToken,
    ) -> Self {
        let pacer = Pacer::from_options(&options);
        Self {
            driver,
            options,
            policy,
            challenge_markers,
            pacer,
            cancel,
            closed: false,
        }
    }

    /// Navigate, retrying timeouts and challenge pages.
    pub fn goto(&mut self, url: &str) -> Result<()> {
        let policy = self.policy.challenge.clone();
        let cancel = self.cancel.clone();
        let outcome = policy.run(
            &format!("load {url}"),
            |attempt| {
                if attempt > 1 && self.policy.reset_on_challenge {
                    self.driver.reset().map_err(|e| automation_failure("reset session", 1, e))?;
                }
                self.navigate(url)?;
                self.check_challenge(url)
            },
            |e| matches!(e, ScoutError::ChallengeDetected { .. }),
            |delay| sleep_unless_cancelled(&cancel, delay),
        );
        outcome.map_err(|exhausted| {
            if let ScoutError::ChallengeDetected { .. } = exhausted.error {
                warn!(url, attempts = exhausted.attempts, "Challenge persisted, giving up");
            }
            exhausted.error
        })
    }

    /// Run steps in order. Optional steps that fail are logged and skipped.
    pub fn apply_steps(&mut self, steps: &[Step]) -> Result<()> {
        for step in steps {
            self.ensure_live()?;
            self.pause(self.pacer.next_delay())?;
            debug!(step = %step.describe(), "Applying step");
            match self.apply_step(step) {
                Ok(()) => {}
                Err(ScoutError::AutomationFailure { reason, .. }) if step.is_optional() => {
                    warn!(step = %step.describe(), %reason, "Optional step failed, continuing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// HTML of the page currently shown.
    pub fn current_html(&mut self) -> Result<String> {
        self.interact("read page", |d| d.content())
    }

    /// Run `prepare` and capture the current page as a [`RawPage`]. A
    /// challenge page is reloaded through the challenge retry path and
    /// `prepare` runs again on the fresh page.
    pub fn capture(&mut self, index: usize, prepare: &[Step]) -> Result<RawPage> {
        self.apply_steps(prepare)?;
        let mut html = self.current_html()?;
        let url = self.interact("read url", |d| d.current_url())?;
        if let Some(marker) = find_marker(&html, &self.challenge_markers) {
            warn!(%url, marker, page = index, "Challenge page instead of results, reloading");
            self.goto(&url)?;
            self.apply_steps(prepare)?;
            html = self.current_html()?;
        }
        Ok(RawPage::new(index, url, html))
    }

    /// Close the browser. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.driver
            .close()
            .map_err(|e| automation_failure("close session", 1, e))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn apply_step(&mut self, step: &Step) -> Result<()> {
        let timeout = self.options.element_timeout();
        match step {
            Step::Navigate { url } => self.goto(url),
            Step::Click { selector, wait_ms, .. } => {
                self.interact(&step.describe(), |d| {
                    d.wait_for(selector, timeout)?;
                    d.click(selector)
                })?;
                self.pause(Duration::from_millis(*wait_ms))
            }
            Step::ClickText { selector, text, .. } => {
                self.interact(&step.describe(), |d| {
                    d.wait_for(selector, timeout)?;
                    d.click_text(selector, text)
                })?;
                self.pause(Duration::from_millis(300))
            }
            Step::Fill {
                selector,
                value,
                wait_ms,
            } => {
                self.interact(&step.describe(), |d| {
                    d.wait_for(selector, timeout)?;
                    d.fill(selector, value)
                })?;
                self.pause(Duration::from_millis(*wait_ms))
            }
            Step::PressKey { key, wait_ms } => {
                self.interact(&step.describe(), |d| d.press_key(key))?;
                self.pause(Duration::from_millis(*wait_ms))
            }
            Step::SetChecked { selector, checked, .. } => {
                let toggled = self.interact(&step.describe(), |d| {
                    d.wait_for(selector, timeout)?;
                    if d.is_checked(selector)? == *checked {
                        return Ok(false);
                    }
                    d.click(selector)?;
                    Ok(true)
                })?;
                if toggled {
                    self.pause(Duration::from_millis(300))?;
                }
                Ok(())
            }
            Step::AdjustSlider {
                selector,
                target,
                from_end,
            } => self.adjust_slider(selector, *target, *from_end),
            Step::WaitFor {
                selector,
                timeout_ms,
                ..
            } => {
                let wait = timeout_ms.map(Duration::from_millis).unwrap_or(timeout);
                self.interact(&step.describe(), |d| d.wait_for(selector, wait))
            }
            Step::Scroll { pixels } => self.interact(&step.describe(), |d| d.scroll_by(*pixels)),
            Step::Pause { ms } => self.pause(Duration::from_millis(*ms)),
        }
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        let timeout = self.options.navigation_timeout();
        let started = Instant::now();
        self.interact(&format!("goto {url}"), |d| d.goto(url, timeout))?;
        info!(url, elapsed = ?started.elapsed(), "Page loaded");
        self.pause(Duration::from_millis(self.options.settle_ms))
    }

    fn check_challenge(&mut self, url: &str) -> Result<()> {
        let html = self.current_html()?;
        match find_marker(&html, &self.challenge_markers) {
            Some(marker) => {
                warn!(url, marker, "Bot challenge detected");
                Err(ScoutError::ChallengeDetected {
                    url: url.to_string(),
                    marker: marker.to_string(),
                })
            }
            None => Ok(()),
        }
    }

    /// Focus a range handle and walk it to `target` with the keyboard.
    fn adjust_slider(&mut self, selector: &str, target: u64, from_end: bool) -> Result<()> {
        let what = format!("slide {selector}");
        let timeout = self.options.element_timeout();
        self.interact(&what, |d| {
            d.wait_for(selector, timeout)?;
            d.focus(selector)
        })?;
        self.pause(Duration::from_millis(200))?;
        self.press(&what, if from_end { "End" } else { "Home" })?;
        self.pause(Duration::from_millis(200))?;

        let (coarse, fine) = if from_end {
            ("PageDown", "ArrowLeft")
        } else {
            ("PageUp", "ArrowRight")
        };
        let mut presses = 0;
        loop {
            let current = self.slider_value(selector)?;
            let gap = if from_end {
                current.saturating_sub(target)
            } else {
                target.saturating_sub(current)
            };
            if gap == 0 || presses >= self.options.max_slider_steps {
                break;
            }
            self.press(&what, if gap > COARSE_SLIDER_GAP { coarse } else { fine })?;
            presses += 1;
            if presses % 10 == 0 {
                self.ensure_live()?;
                self.pause(Duration::from_millis(50))?;
            }
        }

        let reached = self.slider_value(selector)?;
        if reached.abs_diff(target) > self.options.slider_tolerance {
            warn!(selector, target, reached, presses, "Slider stopped away from target");
        } else {
            debug!(selector, target, reached, presses, "Slider set");
        }
        Ok(())
    }

    fn press(&mut self, what: &str, key: &str) -> Result<()> {
        self.driver
            .press_key(key)
            .map_err(|e| automation_failure(what, 1, e))
    }

    fn slider_value(&mut self, selector: &str) -> Result<u64> {
        let raw = self
            .driver
            .attribute(selector, "aria-valuenow")
            .map_err(|e| automation_failure(&format!("read {selector}"), 1, e))?;
        Ok(raw.and_then(|v| v.trim().parse::<f64>().ok()).map_or(0, |v| v.max(0.0) as u64))
    }

    /// Run one driver operation under the automation retry policy.
    fn interact<T>(&mut self, what: &str, mut op: impl FnMut(&mut D) -> anyhow::Result<T>) -> Result<T> {
        let policy = self.policy.automation.clone();
        let cancel = self.cancel.clone();
        let driver = &mut self.driver;
        policy
            .run(
                what,
                |_| {
                    if cancel.is_cancelled() {
                        return Err(AttemptError::Cancelled);
                    }
                    op(&mut *driver).map_err(AttemptError::Driver)
                },
                |e| matches!(e, AttemptError::Driver(_)),
                |delay| sleep_unless_cancelled(&cancel, delay),
            )
            .map_err(|exhausted| match exhausted.error {
                AttemptError::Cancelled => ScoutError::Cancelled,
                AttemptError::Driver(e) => automation_failure(what, exhausted.attempts, e),
            })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ScoutError::Cancelled);
        }
        Ok(())
    }

    fn pause(&self, duration: Duration) -> Result<()> {
        sleep_unless_cancelled(&self.cancel, duration);
        self.ensure_live()
    }
}

impl<D: BrowserDriver> Drop for BrowserSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close browser session");
        }
    }
}

fn automation_failure(action: &str, attempts: u32, error: anyhow::Error) -> ScoutError {
    ScoutError::AutomationFailure {
        action: action.to_string(),
        attempts,
        reason: format!("{error:#}"),
    }
}

fn sleep_unless_cancelled(cancel: &CancellationToken, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
