use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Every field a listing carries, in the order sites describe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingField {
    ListingId,
    Url,
    AddressLine1,
    AddressLine2,
    FullAddress,
    Price,
    Bedrooms,
    Bathrooms,
    Parking,
    PropertyType,
    ImageUrl,
    AgentName,
    AgencyName,
    InspectionTime,
    Status,
}

impl ListingField {
    pub const ALL: [ListingField; 15] = [
        ListingField::ListingId,
        ListingField::Url,
        ListingField::AddressLine1,
        ListingField::AddressLine2,
        ListingField::FullAddress,
        ListingField::Price,
        ListingField::Bedrooms,
        ListingField::Bathrooms,
        ListingField::Parking,
        ListingField::PropertyType,
        ListingField::ImageUrl,
        ListingField::AgentName,
        ListingField::AgencyName,
        ListingField::InspectionTime,
        ListingField::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingField::ListingId => "listing_id",
            ListingField::Url => "url",
            ListingField::AddressLine1 => "address_line1",
            ListingField::AddressLine2 => "address_line2",
            ListingField::FullAddress => "full_address",
            ListingField::Price => "price",
            ListingField::Bedrooms => "bedrooms",
            ListingField::Bathrooms => "bathrooms",
            ListingField::Parking => "parking",
            ListingField::PropertyType => "property_type",
            ListingField::ImageUrl => "image_url",
            ListingField::AgentName => "agent_name",
            ListingField::AgencyName => "agency_name",
            ListingField::InspectionTime => "inspection_time",
            ListingField::Status => "status",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ListingField::Price | ListingField::Bedrooms | ListingField::Bathrooms | ListingField::Parking
        )
    }
}

impl fmt::Display for ListingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How travel time to a location is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TravelMode {
    Transit,
    Driving,
}

impl TravelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TravelMode::Transit => "transit",
            TravelMode::Driving => "driving",
        }
    }
}

impl fmt::Display for TravelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named point of interest that listings are measured against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub address: String,
    /// Stable key used in the listing's travel-time map
    pub slug: String,
    #[serde(default = "default_mode")]
    pub mode: TravelMode,
}

fn default_mode() -> TravelMode {
    TravelMode::Transit
}

impl Location {
    pub fn new(name: &str, address: &str, slug: &str, mode: TravelMode) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            slug: slug.to_string(),
            mode,
        }
    }

    /// Default commute targets.
    pub fn defaults() -> Vec<Location> {
        vec![
            Location::new("Bella Vista", "Bella Vista, NSW, Australia", "bella_vista", TravelMode::Driving),
            Location::new(
                "Royal North Shore Hospital",
                "Reserve Road, St Leonards, NSW 2065, Australia",
                "rnsh",
                TravelMode::Transit,
            ),
            Location::new(
                "Queen Victoria Building",
                "455 George St, Sydney NSW 2000, Australia",
                "qvb",
                TravelMode::Transit,
            ),
        ]
    }
}

/// A resolved travel time. Absence from a listing's map means "not attempted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelTime {
    Minutes(u32),
    /// The distance service has no route for this pair
    Unreachable,
}

impl TravelTime {
    pub fn minutes(&self) -> Option<u32> {
        match self {
            TravelTime::Minutes(m) => Some(*m),
            TravelTime::Unreachable => None,
        }
    }
}

/// One captured result page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    /// 1-based position in the run
    pub index: usize,
    pub url: String,
    pub html: String,
}

impl RawPage {
    pub fn new(index: usize, url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            index,
            url: url.into(),
            html: html.into(),
        }
    }
}

/// Core listing data model
///
/// `listing_id` and `url` are never empty. Numeric fields are `None` when
/// the page did not carry a usable number ("unknown"), never raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyListing {
    pub listing_id: String,
    pub url: String,
    pub source: String,
    pub address_line1: String,
    pub address_line2: String,
    pub full_address: String,
    pub price: Option<u64>,
    /// Price as displayed, e.g. "Contact Agent" or "$650,000"
    pub price_label: String,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub parking: Option<u32>,
    pub property_type: String,
    pub image_url: String,
    pub agent_name: String,
    pub agency_name: String,
    pub inspection_time: String,
    pub status: String,
    /// Location slug -> travel time. Filled only by enrichment.
    #[serde(default)]
    pub travel_times: BTreeMap<String, TravelTime>,
    pub scraped_at: DateTime<Utc>,
}

impl PropertyListing {
    pub fn new(listing_id: impl Into<String>, url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            url: url.into(),
            source: source.into(),
            address_line1: String::new(),
            address_line2: String::new(),
            full_address: String::new(),
            price: None,
            price_label: String::new(),
            bedrooms: None,
            bathrooms: None,
            parking: None,
            property_type: String::new(),
            image_url: String::new(),
            agent_name: String::new(),
            agency_name: String::new(),
            inspection_time: String::new(),
            status: String::new(),
            travel_times: BTreeMap::new(),
            scraped_at: Utc::now(),
        }
    }

    pub fn travel_time(&self, slug: &str) -> Option<TravelTime> {
        self.travel_times.get(slug).copied()
    }
}

/// Ordered listings from one run, unique by listing id. First one wins.
#[derive(Debug, Clone, Default)]
pub struct ListingCollection {
    pub source: String,
    listings: Vec<PropertyListing>,
    seen: HashSet<String>,
}

impl ListingCollection {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Returns false when a listing with the same id is already present.
    pub fn push(&mut self, listing: PropertyListing) -> bool {
        if !self.seen.insert(listing.listing_id.clone()) {
            return false;
        }
        self.listings.push(listing);
        true
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PropertyListing> {
        self.listings.iter()
    }

    pub fn as_mut_slice(&mut self) -> &mut [PropertyListing] {
        &mut self.listings
    }

    pub fn into_vec(self) -> Vec<PropertyListing> {
        self.listings
    }

    /// Sorted distinct suburbs (address line 2).
    pub fn unique_suburbs(&self) -> Vec<String> {
        let mut suburbs: Vec<String> = self
            .listings
            .iter()
            .map(|l| l.address_line2.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        suburbs.sort();
        suburbs.dedup();
        suburbs
    }

    pub fn filter_by_suburb(&self, suburb: &str) -> ListingCollection {
        let needle = suburb.to_lowercase();
        self.filtered(|l| l.address_line2.to_lowercase().contains(&needle))
    }

    /// Drop listings whose known travel time to any location exceeds the
    /// limit for that location's mode. Unreachable or missing entries stay.
    pub fn filter_by_travel_time(
        &self,
        locations: &[Location],
        max_transit_mins: u32,
        max_driving_mins: u32,
    ) -> ListingCollection {
        self.filtered(|listing| {
            locations.iter().all(|location| {
                let limit = match location.mode {
                    TravelMode::Transit => max_transit_mins,
                    TravelMode::Driving => max_driving_mins,
                };
                match listing.travel_time(&location.slug).and_then(|t| t.minutes()) {
                    Some(minutes) => minutes <= limit,
                    None => true,
                }
            })
        })
    }

    fn filtered(&self, keep: impl Fn(&PropertyListing) -> bool) -> ListingCollection {
        let mut out = ListingCollection::new(self.source.clone());
        for listing in self.listings.iter().filter(|l| keep(*l)) {
            out.push(listing.clone());
        }
        out
    }
}

impl IntoIterator for ListingCollection {
    type Item = PropertyListing;
    type IntoIter = std::vec::IntoIter<PropertyListing>;

    fn into_iter(self) -> Self::IntoIter {
        self.listings.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: &str, suburb: &str) -> PropertyListing {
        let mut l = PropertyListing::new(id, format!("https://example.com/{id}"), "test");
        l.address_line2 = suburb.to_string();
        l
    }

    #[test]
    fn test_collection_keeps_first_duplicate() {
        let mut c = ListingCollection::new("test");
        let mut first = listing("1", "CHATSWOOD NSW 2067");
        first.price = Some(900_000);
        assert!(c.push(first));
        assert!(!c.push(listing("1", "ARTARMON NSW 2064")));
        assert!(c.push(listing("2", "ARTARMON NSW 2064")));
        assert_eq!(c.len(), 2);
        assert_eq!(c.iter().next().unwrap().price, Some(900_000));
    }

    #[test]
    fn test_unique_suburbs_and_filter() {
        let mut c = ListingCollection::new("test");
        c.push(listing("1", "Chatswood NSW 2067"));
        c.push(listing("2", "Artarmon NSW 2064"));
        c.push(listing("3", "Chatswood NSW 2067"));
        c.push(listing("4", ""));
        assert_eq!(c.unique_suburbs(), vec!["Artarmon NSW 2064", "Chatswood NSW 2067"]);
        assert_eq!(c.filter_by_suburb("chatswood").len(), 2);
    }

    #[test]
    fn test_filter_by_travel_time_uses_mode_limits() {
        let locations = Location::defaults();
        let mut c = ListingCollection::new("test");

        let mut near = listing("near", "Chatswood");
        near.travel_times.insert("rnsh".into(), TravelTime::Minutes(20));
        near.travel_times.insert("bella_vista".into(), TravelTime::Minutes(30));

        let mut far_drive = listing("far", "Chatswood");
        far_drive.travel_times.insert("bella_vista".into(), TravelTime::Minutes(55));

        let mut unreachable = listing("none", "Chatswood");
        unreachable.travel_times.insert("qvb".into(), TravelTime::Unreachable);

        c.push(near);
        c.push(far_drive);
        c.push(unreachable);

        let kept: Vec<_> = c
            .filter_by_travel_time(&locations, 60, 45)
            .into_iter()
            .map(|l| l.listing_id)
            .collect();
        assert_eq!(kept, vec!["near", "none"]);
    }

    #[test]
    fn test_travel_time_serialization() {
        assert_eq!(serde_json::to_string(&TravelTime::Minutes(42)).unwrap(), r#"{"minutes":42}"#);
        assert_eq!(serde_json::to_string(&TravelTime::Unreachable).unwrap(), r#""unreachable""#);
        assert_eq!(serde_json::to_string(&TravelMode::Driving).unwrap(), r#""driving""#);
    }
}
