//! Site capabilities: a declarative description of how to drive and read
//! one listing website.
//!
//! The rest of the pipeline only ever sees a [`SiteCapability`]. Adding a
//! site means writing a new capability (in code like [`domain`], or as a
//! TOML file loaded with [`load_file`]), never a new code path.
//!
//! A capability is validated once, when it is built. Every listing field
//! must have exactly one extraction rule and every selector and pattern
//! must compile, so a broken site description fails before any browser
//! is launched or any API call is paid for.

pub mod domain;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use url::Url;

use crate::error::{Result, ScoutError};
use crate::models::{ListingField, RawPage};
use crate::scrapers::types::CriteriaField;

/// A primitive browser action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
        #[serde(default)]
        wait_ms: u64,
        /// A failure here is logged and skipped instead of retried
        #[serde(default)]
        optional: bool,
    },
    /// Click the first element matching `selector` whose text contains `text`
    ClickText {
        selector: String,
        text: String,
        #[serde(default)]
        optional: bool,
    },
    Fill {
        selector: String,
        value: String,
        #[serde(default)]
        wait_ms: u64,
    },
    PressKey {
        key: String,
        #[serde(default)]
        wait_ms: u64,
    },
    SetChecked {
        selector: String,
        checked: bool,
        #[serde(default)]
        optional: bool,
    },
    /// Step a range slider with the keyboard until it reaches `target`
    AdjustSlider {
        selector: String,
        target: u64,
        /// Start from the top of the range and walk down
        #[serde(default)]
        from_end: bool,
    },
    WaitFor {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        optional: bool,
    },
    Scroll {
        pixels: i64,
    },
    Pause {
        ms: u64,
    },
}

impl Step {
    pub fn click(selector: &str, wait_ms: u64) -> Self {
        Step::Click {
            selector: selector.to_string(),
            wait_ms,
            optional: false,
        }
    }

    pub fn is_optional(&self) -> bool {
        match self {
            Step::Click { optional, .. }
            | Step::ClickText { optional, .. }
            | Step::SetChecked { optional, .. }
            | Step::WaitFor { optional, .. } => *optional,
            _ => false,
        }
    }

    /// Short human-readable description used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Step::Navigate { url } => format!("navigate {url}"),
            Step::Click { selector, .. } => format!("click {selector}"),
            Step::ClickText { selector, text, .. } => format!("click {selector} \"{text}\""),
            Step::Fill { selector, .. } => format!("fill {selector}"),
            Step::PressKey { key, .. } => format!("press {key}"),
            Step::SetChecked { selector, checked, .. } => format!("set {selector} checked={checked}"),
            Step::AdjustSlider { selector, target, .. } => format!("slide {selector} to {target}"),
            Step::WaitFor { selector, .. } => format!("wait for {selector}"),
            Step::Scroll { pixels } => format!("scroll {pixels}px"),
            Step::Pause { ms } => format!("pause {ms}ms"),
        }
    }
}

/// One part of a search form, bound to the criteria it consumes.
///
/// The engine renders these into concrete [`Step`]s for a given
/// [`SearchCriteria`](crate::scrapers::types::SearchCriteria); parts whose
/// criteria value is unset render to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormStep {
    /// Always applied
    Fixed { step: Step },
    /// Type each location into a typeahead and confirm it
    Locations {
        input_selector: String,
        confirm_key: Option<String>,
        #[serde(default)]
        settle_ms: u64,
    },
    /// Click the selector mapped to the criteria value
    Choice {
        field: CriteriaField,
        options: BTreeMap<String, String>,
        #[serde(default)]
        wait_ms: u64,
    },
    /// Checkbox group where exactly the chosen option ends up checked
    Exclusive {
        field: CriteriaField,
        options: BTreeMap<String, String>,
        /// Extra boxes to clear first, such as an "All" toggle
        #[serde(default)]
        clear: Vec<String>,
    },
    Fill { field: CriteriaField, selector: String },
    Slider {
        field: CriteriaField,
        selector: String,
        #[serde(default)]
        from_end: bool,
    },
    /// Open a dropdown, then pick the option whose text matches the value
    Dropdown {
        field: CriteriaField,
        toggle_selector: String,
        option_selector: String,
    },
    /// Extra steps that only apply when `field` is set
    When { field: CriteriaField, steps: Vec<Step> },
}

/// What part of a matched element a rule reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// Trimmed text, whitespace collapsed
    Text,
    /// Money amount, currency and unit decoration stripped
    Price,
    /// Leading integer, e.g. "2 Beds"
    Count,
    /// Resolved against the site's base URL
    AbsoluteUrl,
}

impl Transform {
    fn default_for(field: ListingField) -> Transform {
        match field {
            ListingField::Price => Transform::Price,
            ListingField::Bedrooms | ListingField::Bathrooms | ListingField::Parking => Transform::Count,
            ListingField::Url | ListingField::ImageUrl => Transform::AbsoluteUrl,
            _ => Transform::Text,
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Transform::Price | Transform::Count)
    }
}

/// Uncompiled extraction rule, as written in code or a capability file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSpec {
    /// CSS selector inside the listing; `None` reads the listing element itself
    pub selector: Option<String>,
    /// Read this attribute instead of the text
    pub attr: Option<String>,
    /// Only consider values containing this (case-insensitive)
    pub contains: Option<String>,
    /// Skip values containing any of these
    pub reject: Vec<String>,
    /// Pick the n-th surviving candidate
    pub nth: usize,
    /// Regex applied to the value; group 1 if present, else the whole match
    pub pattern: Option<String>,
    pub transform: Option<Transform>,
    /// Tried when this rule yields nothing
    pub fallback: Option<Box<RuleSpec>>,
}

impl RuleSpec {
    pub fn text(selector: &str) -> Self {
        Self {
            selector: Some(selector.to_string()),
            ..Self::default()
        }
    }

    pub fn attr(selector: &str, attr: &str) -> Self {
        Self {
            selector: Some(selector.to_string()),
            attr: Some(attr.to_string()),
            ..Self::default()
        }
    }

    /// Read an attribute of the listing element itself.
    pub fn own_attr(attr: &str) -> Self {
        Self {
            attr: Some(attr.to_string()),
            ..Self::default()
        }
    }

    pub fn containing(mut self, needle: &str) -> Self {
        self.contains = Some(needle.to_string());
        self
    }

    pub fn rejecting(mut self, needles: &[&str]) -> Self {
        self.reject = needles.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn nth(mut self, n: usize) -> Self {
        self.nth = n;
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn or_else(mut self, fallback: RuleSpec) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    fn compile(mut self, site: &str, field: ListingField) -> Result<ExtractionRule> {
        let fallback = self
            .fallback
            .take()
            .map(|f| f.compile(site, field).map(Box::new))
            .transpose()?;
        let selector = self
            .selector
            .as_deref()
            .map(|s| compile_selector(site, s))
            .transpose()?;
        let pattern = self
            .pattern
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| ScoutError::configuration(site, format!("bad pattern for {field}: {e}")))
            })
            .transpose()?;
        let transform = self.transform.unwrap_or_else(|| Transform::default_for(field));
        if field.is_numeric() != transform.is_numeric() {
            return Err(ScoutError::configuration(
                site,
                format!("field {field} cannot use transform {transform:?}"),
            ));
        }
        Ok(ExtractionRule {
            selector,
            selector_src: self.selector,
            attr: self.attr,
            contains: self.contains.map(|c| c.to_lowercase()),
            reject: self.reject,
            nth: self.nth,
            pattern,
            transform,
            fallback,
        })
    }
}

/// A compiled rule for one listing field
#[derive(Debug, Clone)]
pub struct ExtractionRule {
    selector: Option<Selector>,
    selector_src: Option<String>,
    attr: Option<String>,
    contains: Option<String>,
    reject: Vec<String>,
    nth: usize,
    pattern: Option<Regex>,
    transform: Transform,
    fallback: Option<Box<ExtractionRule>>,
}

impl ExtractionRule {
    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn selector(&self) -> Option<&str> {
        self.selector_src.as_deref()
    }

    /// Raw value for this rule within one listing fragment, or `None` when
    /// nothing matched.
    pub fn apply(&self, fragment: ElementRef<'_>) -> Option<String> {
        let candidates: Vec<ElementRef<'_>> = match &self.selector {
            Some(selector) => fragment.select(selector).collect(),
            None => vec![fragment],
        };
        candidates
            .into_iter()
            .filter_map(|el| self.read(el))
            .filter(|value| self.accepts(value))
            .filter_map(|value| self.capture(value))
            .nth(self.nth)
            .or_else(|| self.fallback.as_ref()?.apply(fragment))
    }

    fn read(&self, el: ElementRef<'_>) -> Option<String> {
        let value = match &self.attr {
            Some(attr) => el.value().attr(attr)?.trim().to_string(),
            None => collapse_text(el.text()),
        };
        (!value.is_empty()).then_some(value)
    }

    fn accepts(&self, value: &str) -> bool {
        if let Some(needle) = &self.contains {
            if !value.to_lowercase().contains(needle) {
                return false;
            }
        }
        !self.reject.iter().any(|r| value.contains(r.as_str()))
    }

    fn capture(&self, value: String) -> Option<String> {
        let Some(pattern) = &self.pattern else {
            return Some(value);
        };
        let caps = pattern.captures(&value)?;
        let m = caps.get(1).or_else(|| caps.get(0))?;
        let captured = m.as_str().trim();
        (!captured.is_empty()).then(|| captured.to_string())
    }
}

/// Join text nodes and collapse runs of whitespace (including nbsp).
pub fn collapse_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// First marker present in `html`, ignoring case.
pub fn find_marker<'a>(html: &str, markers: &'a [String]) -> Option<&'a str> {
    if markers.is_empty() {
        return None;
    }
    let lower = html.to_lowercase();
    markers
        .iter()
        .find(|m| !m.is_empty() && lower.contains(&m.to_lowercase()))
        .map(String::as_str)
}

fn compile_selector(site: &str, css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| ScoutError::configuration(site, format!("bad selector `{css}`: {e:?}")))
}

/// How to get from one result page to the next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationSpec {
    pub next_selector: String,
    #[serde(default)]
    pub wait_ms: u64,
}

#[derive(Debug, Clone)]
struct Pagination {
    spec: PaginationSpec,
    next: Selector,
}

/// Serializable form of a capability, used for capability files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub base_url: String,
    /// Where a search starts; defaults to `base_url`
    #[serde(default)]
    pub entry_url: Option<String>,
    #[serde(default)]
    pub form: Vec<FormStep>,
    /// Submits the filled form
    #[serde(default)]
    pub submit: Option<Step>,
    #[serde(default)]
    pub results_ready: Option<Step>,
    /// Applied on every result page before its HTML is captured
    #[serde(default)]
    pub capture_steps: Vec<Step>,
    #[serde(default)]
    pub pagination: Option<PaginationSpec>,
    #[serde(default)]
    pub challenge_markers: Vec<String>,
    pub listing_selector: String,
    pub rules: BTreeMap<ListingField, RuleSpec>,
}

/// Builder that validates a capability before it can be used
pub struct SiteCapabilityBuilder {
    spec: CapabilitySpec,
    rules: Vec<(ListingField, RuleSpec)>,
}

impl SiteCapabilityBuilder {
    pub fn new(name: &str, base_url: &str, listing_selector: &str) -> Self {
        Self {
            spec: CapabilitySpec {
                name: name.to_string(),
                base_url: base_url.to_string(),
                entry_url: None,
                form: Vec::new(),
                submit: None,
                results_ready: None,
                capture_steps: Vec::new(),
                pagination: None,
                challenge_markers: Vec::new(),
                listing_selector: listing_selector.to_string(),
                rules: BTreeMap::new(),
            },
            rules: Vec::new(),
        }
    }

    pub fn entry_url(mut self, url: &str) -> Self {
        self.spec.entry_url = Some(url.to_string());
        self
    }

    pub fn form_step(mut self, step: FormStep) -> Self {
        self.spec.form.push(step);
        self
    }

    pub fn submit(mut self, step: Step) -> Self {
        self.spec.submit = Some(step);
        self
    }

    pub fn results_ready(mut self, step: Step) -> Self {
        self.spec.results_ready = Some(step);
        self
    }

    pub fn capture_step(mut self, step: Step) -> Self {
        self.spec.capture_steps.push(step);
        self
    }

    pub fn pagination(mut self, next_selector: &str, wait_ms: u64) -> Self {
        self.spec.pagination = Some(PaginationSpec {
            next_selector: next_selector.to_string(),
            wait_ms,
        });
        self
    }

    pub fn challenge_markers(mut self, markers: &[&str]) -> Self {
        self.spec.challenge_markers = markers.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn rule(mut self, field: ListingField, rule: RuleSpec) -> Self {
        self.rules.push((field, rule));
        self
    }

    pub fn build(self) -> Result<SiteCapability> {
        let Self { mut spec, rules } = self;
        for (field, rule) in rules {
            if spec.rules.insert(field, rule).is_some() {
                return Err(ScoutError::configuration(
                    &spec.name,
                    format!("field {field} has more than one extraction rule"),
                ));
            }
        }
        SiteCapability::from_spec(spec)
    }
}

/// Immutable description of one site
#[derive(Debug, Clone)]
pub struct SiteCapability {
    name: String,
    base_url: Url,
    entry_url: String,
    form: Vec<FormStep>,
    submit: Option<Step>,
    results_ready: Option<Step>,
    capture_steps: Vec<Step>,
    pagination: Option<Pagination>,
    challenge_markers: Vec<String>,
    listing_selector: Selector,
    rules: BTreeMap<ListingField, ExtractionRule>,
}

impl SiteCapability {
    pub fn builder(name: &str, base_url: &str, listing_selector: &str) -> SiteCapabilityBuilder {
        SiteCapabilityBuilder::new(name, base_url, listing_selector)
    }

    /// Validate and compile a capability description.
    pub fn from_spec(spec: CapabilitySpec) -> Result<Self> {
        let site = spec.name.clone();
        if site.trim().is_empty() {
            return Err(ScoutError::configuration("<unnamed>", "site name is empty"));
        }
        let base_url = Url::parse(&spec.base_url)
            .map_err(|e| ScoutError::configuration(&site, format!("bad base_url `{}`: {e}", spec.base_url)))?;

        let missing: Vec<&str> = ListingField::ALL
            .iter()
            .filter(|f| !spec.rules.contains_key(*f))
            .map(|f| f.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(ScoutError::configuration(
                &site,
                format!("no extraction rule for: {}", missing.join(", ")),
            ));
        }

        let mut rules = BTreeMap::new();
        for (field, rule) in spec.rules {
            rules.insert(field, rule.compile(&site, field)?);
        }

        let pagination = spec
            .pagination
            .map(|p| {
                compile_selector(&site, &p.next_selector).map(|next| Pagination { spec: p, next })
            })
            .transpose()?;

        for step in form_selectors(&spec.form)
            .into_iter()
            .chain(spec.submit.iter().flat_map(step_selector))
            .chain(spec.results_ready.iter().flat_map(step_selector))
            .chain(spec.capture_steps.iter().flat_map(step_selector))
        {
            compile_selector(&site, step)?;
        }

        Ok(Self {
            entry_url: spec.entry_url.unwrap_or_else(|| base_url.to_string()),
            listing_selector: compile_selector(&site, &spec.listing_selector)?,
            name: site,
            base_url,
            form: spec.form,
            submit: spec.submit,
            results_ready: spec.results_ready,
            capture_steps: spec.capture_steps,
            pagination,
            challenge_markers: spec.challenge_markers,
            rules,
        })
    }

    /// Parse a capability from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let spec: CapabilitySpec =
            toml::from_str(text).map_err(|e| ScoutError::configuration("<capability file>", e.to_string()))?;
        Self::from_spec(spec)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn entry_url(&self) -> &str {
        &self.entry_url
    }

    /// Form parts in the order they must be applied.
    pub fn locate_search_form(&self) -> &[FormStep] {
        &self.form
    }

    pub fn submit(&self) -> Option<&Step> {
        self.submit.as_ref()
    }

    pub fn results_ready(&self) -> Option<&Step> {
        self.results_ready.as_ref()
    }

    pub fn capture_steps(&self) -> &[Step] {
        &self.capture_steps
    }

    /// The step that reaches the page after `page`, or `None` when `page`
    /// is the last one.
    pub fn locate_next_page(&self, page: &RawPage) -> Option<Step> {
        let pagination = self.pagination.as_ref()?;
        let document = Html::parse_document(&page.html);
        let next = document.select(&pagination.next).next()?;
        let el = next.value();
        let disabled = el.attr("disabled").is_some()
            || el.attr("aria-disabled").is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if disabled {
            return None;
        }
        Some(Step::click(&pagination.spec.next_selector, pagination.spec.wait_ms))
    }

    pub fn extraction_rules(&self) -> &BTreeMap<ListingField, ExtractionRule> {
        &self.rules
    }

    pub fn listing_selector(&self) -> &Selector {
        &self.listing_selector
    }

    pub fn challenge_markers(&self) -> &[String] {
        &self.challenge_markers
    }

    /// First challenge marker present in `html`.
    pub fn detect_challenge(&self, html: &str) -> Option<&str> {
        find_marker(html, &self.challenge_markers)
    }

    /// Resolve a possibly relative link against the site.
    pub fn absolute_url(&self, href: &str) -> Option<String> {
        self.base_url.join(href).ok().map(|u| u.to_string())
    }
}

fn step_selector(step: &Step) -> Option<&str> {
    match step {
        Step::Click { selector, .. }
        | Step::ClickText { selector, .. }
        | Step::Fill { selector, .. }
        | Step::SetChecked { selector, .. }
        | Step::AdjustSlider { selector, .. }
        | Step::WaitFor { selector, .. } => Some(selector),
        Step::Navigate { .. } | Step::PressKey { .. } | Step::Scroll { .. } | Step::Pause { .. } => None,
    }
}

fn form_selectors(form: &[FormStep]) -> Vec<&str> {
    let mut out = Vec::new();
    for part in form {
        match part {
            FormStep::Fixed { step } => out.extend(step_selector(step)),
            FormStep::Locations { input_selector, .. } => out.push(input_selector.as_str()),
            FormStep::Choice { options, .. } => out.extend(options.values().map(String::as_str)),
            FormStep::Exclusive { options, clear, .. } => {
                out.extend(options.values().map(String::as_str));
                out.extend(clear.iter().map(String::as_str));
            }
            FormStep::Fill { selector, .. } | FormStep::Slider { selector, .. } => out.push(selector.as_str()),
            FormStep::Dropdown {
                toggle_selector,
                option_selector,
                ..
            } => {
                out.push(toggle_selector.as_str());
                out.push(option_selector.as_str());
            }
            FormStep::When { steps, .. } => out.extend(steps.iter().flat_map(step_selector)),
        }
    }
    out
}

/// Names of the built-in sites.
pub fn available() -> Vec<&'static str> {
    vec![domain::NAME]
}

/// Built-in capability by name (case-insensitive).
pub fn by_name(name: &str) -> Result<SiteCapability> {
    match name.to_lowercase().as_str() {
        domain::NAME => domain::capability(),
        other => Err(ScoutError::configuration(
            other,
            format!("unknown site; available: {}", available().join(", ")),
        )),
    }
}

/// Load a capability from a TOML file.
pub fn load_file(path: &Path) -> Result<SiteCapability> {
    let text = std::fs::read_to_string(path)?;
    SiteCapability::from_toml_str(&text)
}
