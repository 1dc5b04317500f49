use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which market the search runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Buy,
    Rent,
    Sold,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Buy => "buy",
            SearchMode::Rent => "rent",
            SearchMode::Sold => "sold",
        }
    }
}

/// A criteria value a site's form step can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaField {
    Mode,
    PropertyType,
    NewOrEstablished,
    Bedrooms,
    Bathrooms,
    Parking,
    PriceMin,
    PriceMax,
    Keywords,
}

/// Search criteria for a property search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchCriteria {
    pub mode: SearchMode,
    /// Suburbs to enter into the location typeahead
    pub locations: Vec<String>,
    /// house, apartment, townhouse, land, retirement; `None` or "all" means any
    pub property_type: Option<String>,
    /// established, new; `None` or "any" means any
    pub new_or_established: Option<String>,
    /// Minimum number of bedrooms
    pub bedrooms: Option<u32>,
    /// Minimum number of bathrooms
    pub bathrooms: Option<u32>,
    /// Minimum number of parking spaces
    pub parking: Option<u32>,
    pub price_min: Option<u64>,
    pub price_max: Option<u64>,
    pub keywords: Option<String>,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        let locations = [
            "Chatswood",
            "Chatswood West",
            "Willoughby",
            "Lane Cove",
            "Lane Cove North",
            "Lane Cove West",
            "Greenwich",
            "Gladesville",
            "Hunters Hill",
            "Woolwich",
            "Drummoyne",
            "Artarmon",
            "Lindfield",
            "Killara",
            "Roseville",
            "St Ives",
            "West Ryde",
            "East Ryde",
            "North Ryde",
            "Macquarie Park",
        ];
        Self {
            mode: SearchMode::Buy,
            locations: locations.iter().map(|s| s.to_string()).collect(),
            property_type: Some("apartment".to_string()),
            new_or_established: Some("established".to_string()),
            bedrooms: Some(2),
            bathrooms: Some(1),
            parking: Some(1),
            price_min: None,
            price_max: Some(1_000_000),
            keywords: Some("brick".to_string()),
        }
    }
}

impl SearchCriteria {
    /// The value a form step bound to `field` should use. `None` skips the step.
    pub fn value(&self, field: CriteriaField) -> Option<String> {
        fn non_zero<T: PartialEq + Default + ToString>(v: Option<T>) -> Option<String> {
            v.filter(|n| *n != T::default()).map(|n| n.to_string())
        }

        match field {
            CriteriaField::Mode => Some(self.mode.as_str().to_string()),
            CriteriaField::PropertyType => self
                .property_type
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("all"))
                .map(str::to_lowercase),
            CriteriaField::NewOrEstablished => self
                .new_or_established
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("any"))
                .map(str::to_lowercase),
            CriteriaField::Bedrooms => non_zero(self.bedrooms),
            CriteriaField::Bathrooms => non_zero(self.bathrooms),
            CriteriaField::Parking => non_zero(self.parking),
            CriteriaField::PriceMin => non_zero(self.price_min),
            CriteriaField::PriceMax => non_zero(self.price_max),
            CriteriaField::Keywords => self
                .keywords
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
        }
    }
}

/// Which Chrome mode drives the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrowserEngine {
    /// Classic Chrome, headed or `--headless`
    Chrome,
    /// Chrome's new headless mode (`--headless=new`); full browser
    /// fingerprint, much harder to tell apart from a headed session
    ChromeNewHeadless,
}

/// Launch and pacing settings for a browser session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserOptions {
    pub headless: bool,
    pub engine: BrowserEngine,
    /// No one is watching (CI). Forces headless and the new headless engine.
    pub unattended: bool,
    pub chrome_path: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    /// Apply fingerprint-masking patches to every page
    pub stealth: bool,
    pub navigation_timeout_secs: u64,
    pub element_timeout_secs: u64,
    /// Settle time after a navigation completes
    pub settle_ms: u64,
    /// Randomized pause before each interaction
    pub min_action_delay_ms: u64,
    pub max_action_delay_ms: u64,
    /// Key presses allowed when stepping a range slider
    pub max_slider_steps: u32,
    /// Slider values within this distance of the target count as reached
    pub slider_tolerance: u64,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: false,
            engine: BrowserEngine::Chrome,
            unattended: false,
            chrome_path: None,
            window_width: 1920,
            window_height: 1080,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            accept_language: "en-AU,en;q=0.9".to_string(),
            platform: "Win32".to_string(),
            stealth: true,
            navigation_timeout_secs: 30,
            element_timeout_secs: 5,
            settle_ms: 3_000,
            min_action_delay_ms: 300,
            max_action_delay_ms: 1_200,
            max_slider_steps: 200,
            slider_tolerance: 50_000,
        }
    }
}

impl BrowserOptions {
    /// Apply the unattended override.
    pub fn resolved(&self) -> BrowserOptions {
        let mut opts = self.clone();
        if opts.unattended {
            opts.headless = true;
            opts.engine = BrowserEngine::ChromeNewHeadless;
        }
        if opts.max_action_delay_ms < opts.min_action_delay_ms {
            opts.max_action_delay_ms = opts.min_action_delay_ms;
        }
        opts
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_secs(self.element_timeout_secs)
    }

    /// Options with every pause set to zero, for scripted drivers.
    pub fn without_pacing() -> Self {
        Self {
            settle_ms: 0,
            min_action_delay_ms: 0,
            max_action_delay_ms: 0,
            ..Self::default()
        }
    }
}

/// True when running under CI (GitHub Actions or any `CI=true` runner).
pub fn is_unattended_env() -> bool {
    let flag = |name: &str| {
        std::env::var(name)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    };
    flag("CI") || flag("GITHUB_ACTIONS")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_values_skip_empty_and_any() {
        let criteria = SearchCriteria {
            property_type: Some("All".into()),
            new_or_established: Some("any".into()),
            bedrooms: Some(0),
            bathrooms: None,
            keywords: Some("  ".into()),
            ..SearchCriteria::default()
        };
        assert_eq!(criteria.value(CriteriaField::Mode).as_deref(), Some("buy"));
        assert_eq!(criteria.value(CriteriaField::PropertyType), None);
        assert_eq!(criteria.value(CriteriaField::NewOrEstablished), None);
        assert_eq!(criteria.value(CriteriaField::Bedrooms), None);
        assert_eq!(criteria.value(CriteriaField::Bathrooms), None);
        assert_eq!(criteria.value(CriteriaField::Keywords), None);
        assert_eq!(criteria.value(CriteriaField::PriceMax).as_deref(), Some("1000000"));
    }

    #[test]
    fn test_unattended_forces_headless_new_engine() {
        let opts = BrowserOptions {
            unattended: true,
            headless: false,
            ..BrowserOptions::default()
        }
        .resolved();
        assert!(opts.headless);
        assert_eq!(opts.engine, BrowserEngine::ChromeNewHeadless);

        let interactive = BrowserOptions::default().resolved();
        assert!(!interactive.headless);
        assert_eq!(interactive.engine, BrowserEngine::Chrome);
    }

    #[test]
    fn test_criteria_deserialize_partial() {
        let criteria: SearchCriteria = toml::from_str(
            r#"
            mode = "rent"
            locations = ["Chatswood"]
            bedrooms = 3
            "#,
        )
        .unwrap();
        assert_eq!(criteria.mode, SearchMode::Rent);
        assert_eq!(criteria.locations, vec!["Chatswood"]);
        assert_eq!(criteria.bedrooms, Some(3));
        // unspecified fields fall back to defaults
        assert_eq!(criteria.price_max, Some(1_000_000));
    }
}
