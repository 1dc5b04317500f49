//! domain.com.au
//!
//! Selectors follow the site's `data-testid` attributes where it has them.
//! A few fields only carry generated class names (`css-…`); those break
//! first when the site redeploys.

use std::collections::BTreeMap;

use super::{FormStep, RuleSpec, SiteCapability, Step};
use crate::error::Result;
use crate::models::ListingField;
use crate::scrapers::types::CriteriaField;

pub const NAME: &str = "domain";

const BASE_URL: &str = "https://www.domain.com.au";
const LISTING: &str = r#"li[data-testid^="listing-"]"#;
const PRICE_HANDLE: &str = r#"[data-testid="dynamic-search-filters__range-handle"][aria-valuemax="13000000"]"#;

fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn counts(testid: &str) -> BTreeMap<String, String> {
    (1..=5)
        .map(|n| (n.to_string(), format!(r#"[data-testid="{testid}_{n}"]"#)))
        .collect()
}

pub fn capability() -> Result<SiteCapability> {
    let feature = r#"[data-testid="property-features-feature"]"#;
    let branding = r#"[data-testid="listing-card-branding"] span.css-1xyru6o"#;

    SiteCapability::builder(NAME, BASE_URL, LISTING)
        .entry_url("https://www.domain.com.au/")
        .form_step(FormStep::Choice {
            field: CriteriaField::Mode,
            options: options(&[
                ("buy", r#"[data-testid="buy-navigation"]"#),
                ("rent", r#"[data-testid="rent-navigation"]"#),
                ("sold", r#"[data-testid="sold-navigation"]"#),
            ]),
            wait_ms: 500,
        })
        .form_step(FormStep::Locations {
            input_selector: "#fe-pa-domain-home-typeahead-input".to_string(),
            confirm_key: Some("Enter".to_string()),
            settle_ms: 800,
        })
        .form_step(FormStep::Fixed {
            step: Step::click(r#"[data-testid="search-filters-button-desktop"]"#, 1_500),
        })
        .form_step(FormStep::Exclusive {
            field: CriteriaField::PropertyType,
            options: options(&[
                ("house", r#"input[name="house"]"#),
                ("apartment", r#"input[name="apartment"]"#),
                ("townhouse", r#"input[name="town-house"]"#),
                ("land", r#"input[name="land"]"#),
                ("retirement", r#"input[name="retirements"]"#),
            ]),
            clear: vec![r#"input[name="All"]"#.to_string()],
        })
        .form_step(FormStep::Choice {
            field: CriteriaField::Bedrooms,
            options: counts("bedrooms"),
            wait_ms: 300,
        })
        .form_step(FormStep::When {
            field: CriteriaField::Bedrooms,
            steps: vec![Step::SetChecked {
                selector: r#"input[name="bedrooms_exact"]"#.to_string(),
                checked: true,
                optional: true,
            }],
        })
        .form_step(FormStep::Choice {
            field: CriteriaField::Bathrooms,
            options: counts("Bathrooms"),
            wait_ms: 300,
        })
        .form_step(FormStep::Choice {
            field: CriteriaField::Parking,
            options: counts("Carparks"),
            wait_ms: 300,
        })
        .form_step(FormStep::Slider {
            field: CriteriaField::PriceMin,
            selector: format!(r#"{PRICE_HANDLE}[data-handle-key="0"]"#),
            from_end: false,
        })
        .form_step(FormStep::Slider {
            field: CriteriaField::PriceMax,
            selector: format!(r#"{PRICE_HANDLE}[data-handle-key="1"]"#),
            from_end: true,
        })
        .form_step(FormStep::Dropdown {
            field: CriteriaField::NewOrEstablished,
            toggle_selector: "#search-filters-new-or-established-toggle-button".to_string(),
            option_selector: r#"[role="option"]"#.to_string(),
        })
        .form_step(FormStep::Fill {
            field: CriteriaField::Keywords,
            selector: r#"input[name="keywords"]"#.to_string(),
        })
        .submit(Step::click(r#"button[type="submit"][aria-label="Search"]"#, 2_000))
        .results_ready(Step::WaitFor {
            selector: LISTING.to_string(),
            timeout_ms: Some(15_000),
            optional: true,
        })
        .capture_step(Step::Scroll { pixels: 1_500 })
        .capture_step(Step::Pause { ms: 500 })
        .capture_step(Step::Scroll { pixels: 3_000 })
        .capture_step(Step::Pause { ms: 500 })
        .pagination(r#"a[data-testid="paginator-navigation-button"][rel="next"]"#, 2_000)
        .challenge_markers(&[
            "px-captcha",
            "cf-chl-",
            "Pardon Our Interruption",
            "Access Denied",
            "verify you are a human",
        ])
        .rule(
            ListingField::ListingId,
            RuleSpec::own_attr("data-testid").pattern(r"^listing-(\d+)$"),
        )
        .rule(ListingField::Url, RuleSpec::attr("a[href]", "href").pattern(r"^\S*/[\w-]+-\d+/?$"))
        .rule(ListingField::AddressLine1, RuleSpec::text(r#"[data-testid="address-line1"]"#))
        .rule(ListingField::AddressLine2, RuleSpec::text(r#"[data-testid="address-line2"]"#))
        .rule(
            ListingField::FullAddress,
            RuleSpec::text(r#"[data-testid="address-wrapper"]"#)
                .or_else(RuleSpec::attr(r#"img[alt^="Picture of"]"#, "alt").pattern(r"^Picture of (.+)$")),
        )
        .rule(ListingField::Price, RuleSpec::text(r#"[data-testid="listing-card-price"]"#))
        .rule(ListingField::Bedrooms, RuleSpec::text(feature).containing("bed"))
        .rule(ListingField::Bathrooms, RuleSpec::text(feature).containing("bath"))
        .rule(ListingField::Parking, RuleSpec::text(feature).containing("park"))
        .rule(ListingField::PropertyType, RuleSpec::text("span.css-20sx0y"))
        .rule(
            ListingField::ImageUrl,
            RuleSpec::attr(r#"[data-testid="listing-card-lazy-image"] img"#, "src").rejecting(&["Agencys", "contact_"]),
        )
        .rule(ListingField::AgentName, RuleSpec::text(branding))
        .rule(ListingField::AgencyName, RuleSpec::text(branding).nth(1))
        .rule(ListingField::InspectionTime, RuleSpec::text("div.css-thvxpe span").nth(1))
        .rule(ListingField::Status, RuleSpec::text(r#"[data-testid="listing-card-tag"]"#))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::Transform;

    #[test]
    fn test_capability_is_complete() {
        let cap = capability().unwrap();
        assert_eq!(cap.name(), "domain");
        assert_eq!(cap.extraction_rules().len(), ListingField::ALL.len());
        assert_eq!(cap.extraction_rules()[&ListingField::Bedrooms].transform(), Transform::Count);
        assert_eq!(
            cap.absolute_url("/12-smith-street-chatswood-nsw-2067-2019283746").as_deref(),
            Some("https://www.domain.com.au/12-smith-street-chatswood-nsw-2067-2019283746")
        );
    }

    #[test]
    fn test_form_starts_with_mode_and_submits_separately() {
        let cap = capability().unwrap();
        let form = cap.locate_search_form();
        assert!(matches!(form.first(), Some(FormStep::Choice { field: CriteriaField::Mode, .. })));
        assert!(matches!(form.last(), Some(FormStep::Fill { field: CriteriaField::Keywords, .. })));
        assert!(matches!(cap.submit(), Some(Step::Click { .. })));
    }
}
