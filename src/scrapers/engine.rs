use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::browser::ChromeDriver;
use super::session::{BrowserSession, SessionPolicy};
use super::traits::BrowserDriver;
use super::types::{BrowserOptions, CriteriaField, SearchCriteria};
use crate::error::{Result, ScoutError};
use crate::models::RawPage;
use crate::sites::{FormStep, SiteCapability, Step};

/// Where a search run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Idle,
    FormLoaded,
    CriteriaApplied,
    ResultsLoaded,
    Paginating,
    Done,
    Error,
}

/// Limits for one search run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Result pages to capture at most
    pub max_pages: usize,
    /// Wall-clock budget for the whole run; zero disables it
    pub run_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_pages: 5,
            run_timeout_secs: 600,
        }
    }
}

/// Pages captured by one run
#[derive(Debug)]
pub struct SearchOutcome {
    /// In page order
    pub pages: Vec<RawPage>,
    /// Why the run stopped early, if it did. The pages are then partial.
    pub error: Option<ScoutError>,
}

impl SearchOutcome {
    pub fn is_partial(&self) -> bool {
        self.error.is_some()
    }
}

/// Drives one search against a site and collects result pages.
pub struct SearchEngine<'a> {
    capability: &'a SiteCapability,
    settings: EngineSettings,
    state: SearchState,
}

impl<'a> SearchEngine<'a> {
    pub fn new(capability: &'a SiteCapability, settings: EngineSettings) -> Self {
        Self {
            capability,
            settings,
            state: SearchState::Idle,
        }
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    /// Run a search. The session is closed before this returns, whatever
    /// the outcome.
    pub fn run<D: BrowserDriver>(&mut self, mut session: BrowserSession<D>, criteria: &SearchCriteria) -> SearchOutcome {
        self.state = SearchState::Idle;
        let mut pages = Vec::new();
        let result = self.drive(&mut session, criteria, &mut pages);
        if let Err(e) = session.close() {
            warn!(error = %e, "Failed to close browser session");
        }

        match result {
            Ok(()) => {
                self.transition(SearchState::Done);
                info!(site = self.capability.name(), pages = pages.len(), "Search finished");
                SearchOutcome { pages, error: None }
            }
            Err(e) => {
                self.transition(SearchState::Error);
                error!(site = self.capability.name(), pages = pages.len(), error = %e, "Search stopped early");
                SearchOutcome { pages, error: Some(e) }
            }
        }
    }

    fn drive<D: BrowserDriver>(
        &mut self,
        session: &mut BrowserSession<D>,
        criteria: &SearchCriteria,
        pages: &mut Vec<RawPage>,
    ) -> Result<()> {
        let cap = self.capability;
        info!(site = cap.name(), url = cap.entry_url(), "Opening search form");
        session.goto(cap.entry_url())?;
        self.transition(SearchState::FormLoaded);

        let steps = plan_form(cap, criteria);
        info!(steps = steps.len(), "Applying search criteria");
        session.apply_steps(&steps)?;
        self.transition(SearchState::CriteriaApplied);

        if let Some(submit) = cap.submit() {
            session.apply_steps(std::slice::from_ref(submit))?;
        }
        pages.push(self.capture(session, 1)?);
        self.transition(SearchState::ResultsLoaded);

        while let Some(last) = pages.last() {
            if pages.len() >= self.settings.max_pages {
                info!(max_pages = self.settings.max_pages, "Page ceiling reached");
                break;
            }
            let Some(next) = cap.locate_next_page(last) else {
                debug!(page = last.index, "No further result pages");
                break;
            };
            self.transition(SearchState::Paginating);
            session.apply_steps(std::slice::from_ref(&next))?;
            let index = pages.len() + 1;
            pages.push(self.capture(session, index)?);
            self.transition(SearchState::ResultsLoaded);
        }
        Ok(())
    }

    fn capture<D: BrowserDriver>(&self, session: &mut BrowserSession<D>, index: usize) -> Result<RawPage> {
        let prepare: Vec<Step> = self
            .capability
            .results_ready()
            .into_iter()
            .chain(self.capability.capture_steps())
            .cloned()
            .collect();
        let page = session.capture(index, &prepare)?;
        info!(page = index, url = %page.url, bytes = page.html.len(), "Captured result page");
        Ok(page)
    }

    fn transition(&mut self, next: SearchState) {
        debug!(from = ?self.state, to = ?next, "Search state");
        self.state = next;
    }
}

/// Render the capability's form description for `criteria`.
pub fn plan_form(capability: &SiteCapability, criteria: &SearchCriteria) -> Vec<Step> {
    let mut steps = Vec::new();
    for part in capability.locate_search_form() {
        match part {
            FormStep::Fixed { step } => steps.push(step.clone()),
            FormStep::Locations {
                input_selector,
                confirm_key,
                settle_ms,
            } => {
                for location in criteria.locations.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
                    steps.push(Step::click(input_selector, 0));
                    steps.push(Step::Fill {
                        selector: input_selector.clone(),
                        value: location.to_string(),
                        wait_ms: *settle_ms,
                    });
                    if let Some(key) = confirm_key {
                        steps.push(Step::PressKey {
                            key: key.clone(),
                            wait_ms: 300,
                        });
                    }
                }
            }
            FormStep::Choice { field, options, wait_ms } => {
                if let Some(selector) = option_for(capability, *field, options, criteria) {
                    steps.push(Step::click(selector, *wait_ms));
                }
            }
            FormStep::Exclusive { field, options, clear } => {
                let Some(target) = option_for(capability, *field, options, criteria) else {
                    continue;
                };
                let uncheck = |selector: &String| Step::SetChecked {
                    selector: selector.clone(),
                    checked: false,
                    optional: true,
                };
                steps.extend(clear.iter().map(uncheck));
                steps.extend(options.values().filter(|s| *s != target).map(uncheck));
                steps.push(Step::SetChecked {
                    selector: target.clone(),
                    checked: true,
                    optional: false,
                });
            }
            FormStep::Fill { field, selector } => {
                if let Some(value) = criteria.value(*field) {
                    steps.push(Step::Fill {
                        selector: selector.clone(),
                        value,
                        wait_ms: 300,
                    });
                }
            }
            FormStep::Slider {
                field,
                selector,
                from_end,
            } => {
                let Some(value) = criteria.value(*field) else {
                    continue;
                };
                match value.parse::<u64>() {
                    Ok(target) => steps.push(Step::AdjustSlider {
                        selector: selector.clone(),
                        target,
                        from_end: *from_end,
                    }),
                    Err(_) => warn!(?field, %value, "Slider value is not a number, skipping"),
                }
            }
            FormStep::Dropdown {
                field,
                toggle_selector,
                option_selector,
            } => {
                if let Some(value) = criteria.value(*field) {
                    steps.push(Step::click(toggle_selector, 500));
                    steps.push(Step::ClickText {
                        selector: option_selector.clone(),
                        text: value,
                        optional: true,
                    });
                }
            }
            FormStep::When { field, steps: extra } => {
                if criteria.value(*field).is_some() {
                    steps.extend(extra.iter().cloned());
                }
            }
        }
    }
    steps
}

fn option_for<'o>(
    capability: &SiteCapability,
    field: CriteriaField,
    options: &'o std::collections::BTreeMap<String, String>,
    criteria: &SearchCriteria,
) -> Option<&'o String> {
    let value = criteria.value(field)?;
    let selector = options.get(&value);
    if selector.is_none() {
        warn!(site = capability.name(), ?field, %value, "Site has no option for this value, skipping");
    }
    selector
}

/// Launch Chrome and run one search under the configured deadline.
///
/// Browser work is blocking, so it runs on the blocking pool. When the
/// deadline passes or `cancel` fires, the session abandons its current
/// interaction, closes, and the pages captured so far are returned.
pub async fn search_with_chrome(
    capability: Arc<SiteCapability>,
    criteria: SearchCriteria,
    options: BrowserOptions,
    policy: SessionPolicy,
    settings: EngineSettings,
    cancel: CancellationToken,
) -> SearchOutcome {
    let deadline = settings.run_timeout_secs;
    let worker_cancel = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        let options = options.resolved();
        let driver = match ChromeDriver::launch(&options) {
            Ok(driver) => driver,
            Err(e) => {
                return SearchOutcome {
                    pages: Vec::new(),
                    error: Some(ScoutError::AutomationFailure {
                        action: "launch browser".to_string(),
                        attempts: 1,
                        reason: format!("{e:#}"),
                    }),
                }
            }
        };
        let session = BrowserSession::open(
            driver,
            options,
            policy,
            capability.challenge_markers().to_vec(),
            worker_cancel,
        );
        SearchEngine::new(&capability, settings).run(session, &criteria)
    });

    let joined = if deadline == 0 {
        handle.await
    } else {
        tokio::select! {
            joined = &mut handle => joined,
            _ = tokio::time::sleep(Duration::from_secs(deadline)) => {
                warn!(deadline_secs = deadline, "Search deadline reached, cancelling");
                cancel.cancel();
                handle.await
            }
        }
    };

    joined.unwrap_or_else(|e| SearchOutcome {
        pages: Vec::new(),
        error: Some(ScoutError::AutomationFailure {
            action: "search worker".to_string(),
            attempts: 1,
            reason: e.to_string(),
        }),
    })
}
