//! Extraction of listings from captured result pages.
//!
//! Parsing is a pure function of a page and a capability: no network, no
//! shared state. A field whose rule matches nothing becomes unknown and
//! is reported as an [`ExtractionGap`]; it never stops the rest of the
//! page from being read.

pub mod normalize;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html};
use std::collections::{BTreeMap, HashSet};
use std::thread;
use tracing::{debug, info, warn};

use crate::error::ExtractionGap;
use crate::models::{ListingCollection, ListingField, PropertyListing, RawPage};
use crate::sites::{ExtractionRule, SiteCapability, Transform};
use normalize::{normalize_count, normalize_price};

lazy_static! {
    static ref TRAILING_ID: Regex = Regex::new(r"-(\d+)/?$").expect("id pattern is valid");
}

/// Listings read from one page
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub listings: Vec<PropertyListing>,
    pub gaps: Vec<ExtractionGap>,
    /// Fragments without a usable id or URL
    pub dropped: usize,
    /// Repeats of an id already seen on this page
    pub duplicates: usize,
}

/// Reads listings with one site's extraction rules
pub struct ListingParser<'a> {
    capability: &'a SiteCapability,
}

impl<'a> ListingParser<'a> {
    pub fn new(capability: &'a SiteCapability) -> Self {
        Self { capability }
    }

    /// Listings on one page, first occurrence of each id kept.
    pub fn parse(&self, page: &RawPage) -> Vec<PropertyListing> {
        self.parse_with_gaps(page).listings
    }

    pub fn parse_with_gaps(&self, page: &RawPage) -> ParsedPage {
        let document = Html::parse_document(&page.html);
        let scraped_at = Utc::now();
        let mut parsed = ParsedPage::default();
        let mut seen = HashSet::new();

        for fragment in document.select(self.capability.listing_selector()) {
            let Some(listing) = self.extract(fragment, scraped_at, &mut parsed.gaps) else {
                parsed.dropped += 1;
                continue;
            };
            if seen.insert(listing.listing_id.clone()) {
                parsed.listings.push(listing);
            } else {
                debug!(id = %listing.listing_id, page = page.index, "Duplicate listing on page");
                parsed.duplicates += 1;
            }
        }

        if parsed.dropped > 0 {
            warn!(page = page.index, dropped = parsed.dropped, "Listings without id or URL were skipped");
        }
        info!(
            site = self.capability.name(),
            page = page.index,
            listings = parsed.listings.len(),
            gaps = parsed.gaps.len(),
            "Parsed page"
        );
        parsed
    }

    /// Parse pages in parallel and merge them in page order. A listing
    /// repeated on a later page is discarded in favour of the first.
    pub fn parse_pages(&self, pages: &[RawPage]) -> ListingCollection {
        let per_page: Vec<Vec<PropertyListing>> = thread::scope(|scope| {
            let handles: Vec<_> = pages
                .iter()
                .map(|page| scope.spawn(move || self.parse(page)))
                .collect();
            handles
                .into_iter()
                .zip(pages)
                .map(|(handle, page)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!(page = page.index, "Parser thread panicked, page skipped");
                        Vec::new()
                    })
                })
                .collect()
        });

        let mut collection = ListingCollection::new(self.capability.name());
        let mut repeats = 0;
        for listing in per_page.into_iter().flatten() {
            if !collection.push(listing) {
                repeats += 1;
            }
        }
        if repeats > 0 {
            debug!(repeats, "Listings repeated across pages were dropped");
        }
        collection
    }

    fn extract(
        &self,
        fragment: ElementRef<'_>,
        scraped_at: DateTime<Utc>,
        gaps: &mut Vec<ExtractionGap>,
    ) -> Option<PropertyListing> {
        let rules = self.capability.extraction_rules();
        let raw: BTreeMap<ListingField, Option<String>> = rules
            .iter()
            .map(|(field, rule)| (*field, rule.apply(fragment)))
            .collect();
        let raw_of = |field: ListingField| raw.get(&field).cloned().flatten();

        let url = raw_of(ListingField::Url).and_then(|href| self.capability.absolute_url(&href));
        let id = raw_of(ListingField::ListingId)
            .or_else(|| url.as_deref().and_then(id_from_url))
            .filter(|id| !id.trim().is_empty());
        let (Some(id), Some(url)) = (id, url) else {
            debug!(site = self.capability.name(), "Fragment without id or URL");
            return None;
        };

        let mut listing = PropertyListing::new(id.trim(), url, self.capability.name());
        listing.scraped_at = scraped_at;

        for (field, rule) in rules {
            if matches!(field, ListingField::ListingId | ListingField::Url) {
                continue;
            }
            let value = raw_of(*field);
            let known = match &value {
                Some(raw) => self.assign(&mut listing, *field, rule, raw),
                None => false,
            };
            if !known {
                debug!(id = %listing.listing_id, field = %field, "No value extracted");
                gaps.push(ExtractionGap {
                    listing_id: listing.listing_id.clone(),
                    field: *field,
                });
            }
        }

        if listing.address_line1.is_empty() {
            if let Some((line1, line2)) = split_address(&listing.full_address) {
                listing.address_line1 = line1;
                if listing.address_line2.is_empty() {
                    listing.address_line2 = line2;
                }
            }
        }
        if listing.full_address.is_empty() {
            listing.full_address = [listing.address_line1.as_str(), listing.address_line2.as_str()]
                .iter()
                .filter(|s| !s.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join(" ");
        }
        if listing.status.is_empty() {
            listing.status = infer_status(&listing.price_label).unwrap_or_default().to_string();
        }
        Some(listing)
    }

    /// Store one extracted value. Returns false when it did not normalise.
    fn assign(&self, listing: &mut PropertyListing, field: ListingField, rule: &ExtractionRule, raw: &str) -> bool {
        let text = match rule.transform() {
            Transform::AbsoluteUrl => self.capability.absolute_url(raw).unwrap_or_else(|| raw.to_string()),
            _ => raw.to_string(),
        };
        let number = match rule.transform() {
            Transform::Price => normalize_price(raw),
            Transform::Count => normalize_count(raw).map(u64::from),
            Transform::Text | Transform::AbsoluteUrl => None,
        };
        let count = number.and_then(|n| u32::try_from(n).ok());

        match field {
            ListingField::Price => {
                listing.price_label = text;
                listing.price = number;
                return number.is_some();
            }
            ListingField::Bedrooms => listing.bedrooms = count,
            ListingField::Bathrooms => listing.bathrooms = count,
            ListingField::Parking => listing.parking = count,
            ListingField::AddressLine1 => listing.address_line1 = text,
            ListingField::AddressLine2 => listing.address_line2 = text,
            ListingField::FullAddress => listing.full_address = text,
            ListingField::PropertyType => listing.property_type = text,
            ListingField::ImageUrl => listing.image_url = text,
            ListingField::AgentName => listing.agent_name = text,
            ListingField::AgencyName => listing.agency_name = text,
            ListingField::InspectionTime => listing.inspection_time = text,
            ListingField::Status => listing.status = text,
            ListingField::ListingId | ListingField::Url => {}
        }
        !field.is_numeric() || count.is_some()
    }
}

/// Parse one page with `capability`.
pub fn parse(page: &RawPage, capability: &SiteCapability) -> Vec<PropertyListing> {
    ListingParser::new(capability).parse(page)
}

fn id_from_url(url: &str) -> Option<String> {
    TRAILING_ID
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// `12 Smith Street, CHATSWOOD NSW 2067` into street and locality, split
/// at the last comma. The street part keeps its trailing comma, as on the
/// result cards.
fn split_address(full: &str) -> Option<(String, String)> {
    let (street, locality) = full.rsplit_once(',')?;
    let (street, locality) = (street.trim(), locality.trim());
    if street.is_empty() || locality.is_empty() {
        return None;
    }
    Some((format!("{street},"), locality.to_string()))
}

/// Status implied by a price label when the page shows no status tag.
pub fn infer_status(price_label: &str) -> Option<&'static str> {
    let label = price_label.to_lowercase();
    if label.contains("sold") {
        Some("Sold")
    } else if label.contains("for sale") || label.contains("contact") {
        Some("For Sale")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::domain;
    use pretty_assertions::assert_eq;

    const CARD: &str = r#"
        <li data-testid="listing-2019283746">
          <div data-testid="listing-card-lazy-image"><img src="https://img.example/Agencys/logo.png"><img src="https://img.example/photo-1.jpg"></div>
          <a href="https://www.domain.com.au/search?x=1">search</a>
          <a href="/12-5-smith-street-chatswood-nsw-2067-2019283746">open</a>
          <p data-testid="listing-card-price">$1.25m</p>
          <h2 data-testid="address-wrapper">
            <span data-testid="address-line1">12/5 Smith Street,</span>
            <span data-testid="address-line2"><span>CHATSWOOD</span> <span>NSW</span> <span>2067</span></span>
          </h2>
          <div data-testid="property-features-wrapper">
            <span data-testid="property-features-feature">2 Beds</span>
            <span data-testid="property-features-feature">1 Bath</span>
            <span data-testid="property-features-feature">− Parking</span>
          </div>
          <span class="css-20sx0y">Apartment / Unit / Flat</span>
          <div data-testid="listing-card-branding"><span class="css-1xyru6o">Jane Citizen</span><span class="css-1xyru6o">Ray White Chatswood</span></div>
          <div class="css-thvxpe"><span>Inspection</span><span>Sat 14 Dec</span></div>
        </li>"#;

    fn page(body: &str) -> RawPage {
        RawPage::new(1, "https://www.domain.com.au/sale/chatswood-nsw-2067/", format!("<html><body><ul>{body}</ul></body></html>"))
    }

    #[test]
    fn test_parse_domain_card() {
        let cap = domain::capability().unwrap();
        let parsed = ListingParser::new(&cap).parse_with_gaps(&page(CARD));
        assert_eq!(parsed.listings.len(), 1);
        let l = &parsed.listings[0];

        assert_eq!(l.listing_id, "2019283746");
        assert_eq!(l.url, "https://www.domain.com.au/12-5-smith-street-chatswood-nsw-2067-2019283746");
        assert_eq!(l.source, "domain");
        assert_eq!(l.address_line1, "12/5 Smith Street,");
        assert_eq!(l.address_line2, "CHATSWOOD NSW 2067");
        assert_eq!(l.full_address, "12/5 Smith Street, CHATSWOOD NSW 2067");
        assert_eq!(l.price, Some(1_250_000));
        assert_eq!(l.price_label, "$1.25m");
        assert_eq!(l.bedrooms, Some(2));
        assert_eq!(l.bathrooms, Some(1));
        assert_eq!(l.parking, None);
        assert_eq!(l.property_type, "Apartment / Unit / Flat");
        assert_eq!(l.image_url, "https://img.example/photo-1.jpg");
        assert_eq!(l.agent_name, "Jane Citizen");
        assert_eq!(l.agency_name, "Ray White Chatswood");
        assert_eq!(l.inspection_time, "Sat 14 Dec");
        assert_eq!(l.status, "");

        let gap_fields: Vec<ListingField> = parsed.gaps.iter().map(|g| g.field).collect();
        assert_eq!(gap_fields, vec![ListingField::Parking, ListingField::Status]);
    }

    #[test]
    fn test_missing_price_is_unknown_and_status_inferred() {
        let cap = domain::capability().unwrap();
        let card = CARD.replace("$1.25m", "Contact Agent");
        let listings = parse(&page(&card), &cap);
        assert_eq!(listings[0].price, None);
        assert_eq!(listings[0].price_label, "Contact Agent");
        assert_eq!(listings[0].status, "For Sale");
    }

    #[test]
    fn test_fragment_without_url_is_dropped_not_fatal() {
        let cap = domain::capability().unwrap();
        let broken = r#"<li data-testid="listing-1"><p>nothing here</p></li>"#;
        let parsed = ListingParser::new(&cap).parse_with_gaps(&page(&format!("{broken}{CARD}")));
        assert_eq!(parsed.dropped, 1);
        assert_eq!(parsed.listings.len(), 1);
    }

    #[test]
    fn test_duplicates_within_page_keep_first() {
        let cap = domain::capability().unwrap();
        let second = CARD.replace("$1.25m", "$999,000");
        let parsed = ListingParser::new(&cap).parse_with_gaps(&page(&format!("{CARD}{second}")));
        assert_eq!(parsed.listings.len(), 1);
        assert_eq!(parsed.duplicates, 1);
        assert_eq!(parsed.listings[0].price, Some(1_250_000));
    }

    #[test]
    fn test_address_from_image_alt_when_wrapper_missing() {
        let cap = domain::capability().unwrap();
        let start = CARD.find("<h2").unwrap();
        let end = CARD.find("</h2>").unwrap() + "</h2>".len();
        let card = format!(
            "{}<img alt=\"Picture of 7 Help Street, CHATSWOOD NSW 2067\">{}",
            &CARD[..start],
            &CARD[end..]
        );

        let parsed = ListingParser::new(&cap).parse_with_gaps(&page(&card));
        let l = &parsed.listings[0];
        assert_eq!(l.full_address, "7 Help Street, CHATSWOOD NSW 2067");
        assert_eq!(l.address_line1, "7 Help Street,");
        assert_eq!(l.address_line2, "CHATSWOOD NSW 2067");
        assert!(!parsed.gaps.iter().any(|g| g.field == ListingField::FullAddress));
    }

    #[test]
    fn test_split_address() {
        assert_eq!(
            split_address("1/2 Main Rd, Artarmon NSW 2064"),
            Some(("1/2 Main Rd,".to_string(), "Artarmon NSW 2064".to_string()))
        );
        assert_eq!(split_address("Artarmon NSW 2064"), None);
    }

    #[test]
    fn test_id_falls_back_to_url() {
        assert_eq!(id_from_url("https://www.domain.com.au/1-smith-st-2019283746").as_deref(), Some("2019283746"));
        assert_eq!(id_from_url("https://www.domain.com.au/sale/"), None);
    }

    #[test]
    fn test_infer_status() {
        assert_eq!(infer_status("SOLD - $1,100,000"), Some("Sold"));
        assert_eq!(infer_status("Contact Agent"), Some("For Sale"));
        assert_eq!(infer_status("$900,000"), None);
    }

    #[test]
    fn test_parse_pages_dedupes_across_pages_in_order() {
        let cap = domain::capability().unwrap();
        let other = CARD.replace("2019283746", "2019000001");
        let pages = vec![
            RawPage::new(1, "p1", format!("<ul>{CARD}</ul>")),
            RawPage::new(2, "p2", format!("<ul>{other}{CARD}</ul>")),
        ];
        let ids: Vec<String> = ListingParser::new(&cap)
            .parse_pages(&pages)
            .iter()
            .map(|l| l.listing_id.clone())
            .collect();
        assert_eq!(ids, vec!["2019283746", "2019000001"]);
    }
}
