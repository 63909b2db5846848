//! Core domain model for the bus listing harvester.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "busharvest-core";

/// Air conditioning layout. Unrecognized labels resolve to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AirConditioning {
    Rear,
    Dash,
    Both,
    Other,
    #[default]
    None,
}

impl AirConditioning {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rear => "REAR",
            Self::Dash => "DASH",
            Self::Both => "BOTH",
            Self::Other => "OTHER",
            Self::None => "NONE",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "REAR" => Self::Rear,
            "DASH" => Self::Dash,
            "BOTH" => Self::Both,
            "NONE" | "" => Self::None,
            _ => Self::Other,
        }
    }

    /// The listing site only exposes a yes/no flag, so only `Dash` and `None`
    /// are reachable from scraped data.
    pub fn from_flag(present: bool) -> Self {
        if present {
            Self::Dash
        } else {
            Self::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum UsRegion {
    Northeast,
    Midwest,
    West,
    Southwest,
    Southeast,
    #[default]
    Other,
}

const STATE_REGIONS: &[(&str, &str, UsRegion)] = &[
    ("CT", "connecticut", UsRegion::Northeast),
    ("ME", "maine", UsRegion::Northeast),
    ("MA", "massachusetts", UsRegion::Northeast),
    ("NH", "new hampshire", UsRegion::Northeast),
    ("RI", "rhode island", UsRegion::Northeast),
    ("VT", "vermont", UsRegion::Northeast),
    ("NJ", "new jersey", UsRegion::Northeast),
    ("NY", "new york", UsRegion::Northeast),
    ("PA", "pennsylvania", UsRegion::Northeast),
    ("DE", "delaware", UsRegion::Northeast),
    ("MD", "maryland", UsRegion::Northeast),
    ("DC", "district of columbia", UsRegion::Northeast),
    ("IL", "illinois", UsRegion::Midwest),
    ("IN", "indiana", UsRegion::Midwest),
    ("MI", "michigan", UsRegion::Midwest),
    ("OH", "ohio", UsRegion::Midwest),
    ("WI", "wisconsin", UsRegion::Midwest),
    ("IA", "iowa", UsRegion::Midwest),
    ("KS", "kansas", UsRegion::Midwest),
    ("MN", "minnesota", UsRegion::Midwest),
    ("MO", "missouri", UsRegion::Midwest),
    ("NE", "nebraska", UsRegion::Midwest),
    ("ND", "north dakota", UsRegion::Midwest),
    ("SD", "south dakota", UsRegion::Midwest),
    ("AZ", "arizona", UsRegion::Southwest),
    ("NM", "new mexico", UsRegion::Southwest),
    ("OK", "oklahoma", UsRegion::Southwest),
    ("TX", "texas", UsRegion::Southwest),
    ("CO", "colorado", UsRegion::West),
    ("WY", "wyoming", UsRegion::West),
    ("MT", "montana", UsRegion::West),
    ("ID", "idaho", UsRegion::West),
    ("WA", "washington", UsRegion::West),
    ("OR", "oregon", UsRegion::West),
    ("UT", "utah", UsRegion::West),
    ("NV", "nevada", UsRegion::West),
    ("CA", "california", UsRegion::West),
    ("AK", "alaska", UsRegion::West),
    ("HI", "hawaii", UsRegion::West),
    ("WV", "west virginia", UsRegion::Southeast),
    ("VA", "virginia", UsRegion::Southeast),
    ("KY", "kentucky", UsRegion::Southeast),
    ("TN", "tennessee", UsRegion::Southeast),
    ("NC", "north carolina", UsRegion::Southeast),
    ("SC", "south carolina", UsRegion::Southeast),
    ("GA", "georgia", UsRegion::Southeast),
    ("FL", "florida", UsRegion::Southeast),
    ("AL", "alabama", UsRegion::Southeast),
    ("MS", "mississippi", UsRegion::Southeast),
    ("AR", "arkansas", UsRegion::Southeast),
    ("LA", "louisiana", UsRegion::Southeast),
];

impl UsRegion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Northeast => "NORTHEAST",
            Self::Midwest => "MIDWEST",
            Self::West => "WEST",
            Self::Southwest => "SOUTHWEST",
            Self::Southeast => "SOUTHEAST",
            Self::Other => "OTHER",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "NORTHEAST" => Self::Northeast,
            "MIDWEST" => Self::Midwest,
            "WEST" => Self::West,
            "SOUTHWEST" => Self::Southwest,
            "SOUTHEAST" => Self::Southeast,
            _ => Self::Other,
        }
    }

    /// Resolve a free-form location ("Kansas City, MO", "Dallas Texas") to a region.
    ///
    /// A trailing two-letter state code wins over a spelled-out state name, since
    /// city names frequently contain state names.
    pub fn from_location(location: &str) -> Self {
        let tokens = location
            .split(|c: char| !c.is_ascii_alphabetic())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>();

        for token in tokens.iter().rev() {
            if token.len() == 2 && token.chars().all(|c| c.is_ascii_uppercase()) {
                if let Some((_, _, region)) = STATE_REGIONS.iter().find(|(code, _, _)| code == token) {
                    return *region;
                }
            }
        }

        let normalized = format!(
            " {} ",
            tokens
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect::<Vec<_>>()
                .join(" ")
        );
        let mut by_name = STATE_REGIONS.iter().collect::<Vec<_>>();
        by_name.sort_by_key(|(_, name, _)| std::cmp::Reverse(name.len()));
        by_name
            .into_iter()
            .find(|(_, name, _)| normalized.contains(&format!(" {name} ")))
            .map(|(_, _, region)| *region)
            .unwrap_or(Self::Other)
    }
}

/// One row discovered on a catalog index page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingStub {
    pub title: String,
    pub price: String,
    pub detail_url: String,
}

/// Normalized value from the detail page specification table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecValue {
    Flag(bool),
    Integer(i64),
    Text(String),
    Null,
}

impl SpecValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Integer(n) => Some(n.to_string()),
            Self::Flag(true) => Some("Yes".to_string()),
            Self::Flag(false) => Some("No".to_string()),
            Self::Null => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            Self::Text(s) => Some(s.trim().eq_ignore_ascii_case("yes")),
            _ => None,
        }
    }
}

/// Spec table keyed by normalized label (`"interior_color"`), ordered for stable output.
pub type SpecMap = BTreeMap<String, SpecValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    pub alt: String,
}

/// Raw field map extracted from one detail page; handoff from extraction into assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DetailFields {
    pub specs: SpecMap,
    pub main_description: Option<String>,
    pub interior_description: Option<String>,
    pub exterior_description: Option<String>,
    pub features: Vec<String>,
    pub vin: Option<String>,
    pub dimensions: Option<String>,
    pub luggage: bool,
    pub state_bus_standard: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub images: Vec<ImageRef>,
}

/// Canonical vehicle record. `source_url` is the identity used for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bus {
    pub title: String,
    pub year: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub body: Option<String>,
    pub chassis: Option<String>,
    pub engine: Option<String>,
    pub transmission: Option<String>,
    pub mileage: Option<String>,
    pub passengers: Option<String>,
    pub wheelchair: Option<String>,
    pub color: Option<String>,
    pub interior_color: Option<String>,
    pub exterior_color: Option<String>,
    pub published: bool,
    pub featured: bool,
    pub sold: bool,
    pub scraped: bool,
    pub draft: bool,
    pub source: Option<String>,
    pub source_url: String,
    pub price: String,
    pub vin: Option<String>,
    pub gvwr: Option<String>,
    pub dimensions: Option<String>,
    pub luggage: bool,
    pub state_bus_standard: Option<String>,
    pub airconditioning: AirConditioning,
    pub location: Option<String>,
    pub brake: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub us_region: UsRegion,
    pub description: Option<String>,
    pub score: i32,
    pub category_id: i32,
}

impl Bus {
    /// A record with every optional field empty and every flag/category at its default.
    pub fn new(title: impl Into<String>, price: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            year: None,
            make: None,
            model: None,
            body: None,
            chassis: None,
            engine: None,
            transmission: None,
            mileage: None,
            passengers: None,
            wheelchair: None,
            color: None,
            interior_color: None,
            exterior_color: None,
            published: false,
            featured: false,
            sold: false,
            scraped: false,
            draft: false,
            source: None,
            source_url: source_url.into(),
            price: price.into(),
            vin: None,
            gvwr: None,
            dimensions: None,
            luggage: false,
            state_bus_standard: None,
            airconditioning: AirConditioning::None,
            location: None,
            brake: None,
            contact_email: None,
            contact_phone: None,
            us_region: UsRegion::Other,
            description: None,
            score: 0,
            category_id: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BusOverview {
    pub mdesc: Option<String>,
    pub intdesc: Option<String>,
    pub extdesc: Option<String>,
    pub features: Option<String>,
    pub specs: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusImage {
    pub name: String,
    pub url: String,
    pub description: String,
    pub image_index: i32,
}

/// Output of record assembly: one parent record with its owned children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledBus {
    pub bus: Bus,
    pub overview: BusOverview,
    pub images: Vec<BusImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBus {
    pub id: i64,
    #[serde(flatten)]
    pub bus: Bus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverviewRow {
    pub bus_id: i64,
    #[serde(flatten)]
    pub overview: BusOverview,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRow {
    pub bus_id: i64,
    #[serde(flatten)]
    pub image: BusImage,
}

/// The full reconciled record set of one run, as exported to the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransformedSet {
    pub buses: Vec<StoredBus>,
    pub overview: Vec<OverviewRow>,
    pub images: Vec<ImageRow>,
}

impl TransformedSet {
    pub fn push(&mut self, bus_id: i64, assembled: AssembledBus) {
        let AssembledBus {
            bus,
            overview,
            images,
        } = assembled;
        self.buses.push(StoredBus { id: bus_id, bus });
        self.overview.push(OverviewRow { bus_id, overview });
        self.images
            .extend(images.into_iter().map(|image| ImageRow { bus_id, image }));
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }
}
