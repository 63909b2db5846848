//! Catalog site profile plus listing and detail page extraction.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use busharvest_core::{DetailFields, ImageRef, ListingStub, SpecMap, SpecValue};
use busharvest_storage::{FetchError, PageSource};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "busharvest-adapters";

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("valid year regex"));

static FUEL_ENGINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(diesel|gasoline|gas|propane|cng|electric)\b[\s,/-]+([A-Za-z0-9][A-Za-z0-9.\-]*)")
        .expect("valid fuel/engine regex")
});

const FLAG_KEYS: &[&str] = &[
    "wheel_chair_accessible",
    "air_conditioning",
    "manufacturer_warranty_remaining",
];
const INTEGER_KEYS: &[&str] = &["price", "mileage", "capacity"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}` in {field}: {message}")]
    Selector {
        field: &'static str,
        selector: String,
        message: String,
    },
    #[error("invalid base url `{0}`")]
    BaseUrl(String),
}

/// Where the catalog lives and how its markup is addressed.
///
/// Every selector field is ordered: the first entry is the primary strategy and
/// later entries are fallbacks tried only when earlier ones match nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    pub base_url: String,
    pub page_path: String,
    pub pagination: Vec<String>,
    pub listing_item: Vec<String>,
    pub listing_title: Vec<String>,
    pub listing_link: Vec<String>,
    pub listing_price: Vec<String>,
    pub detail_root: Vec<String>,
    pub spec_rows: Vec<String>,
    pub spec_label: Vec<String>,
    pub spec_value: Vec<String>,
    pub main_description: Vec<String>,
    pub interior_description: Vec<String>,
    pub exterior_description: Vec<String>,
    pub features: Vec<String>,
    pub contact_email: Vec<String>,
    pub contact_phone: Vec<String>,
    pub gallery_images: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            base_url: "https://www.centralstatesbus.com".to_string(),
            page_path: "/page/{page}/?posts_per_page=10".to_string(),
            pagination: strings(&[".stm_ajax_pagination .page-numbers"]),
            listing_item: strings(&[".listing-list-loop.stm-listing-directory-list-loop"]),
            listing_title: strings(&[".title a"]),
            listing_link: strings(&[".title a"]),
            listing_price: strings(&[".price .heading-font", ".price"]),
            detail_root: strings(&[".stm-single-car-page", "#main"]),
            spec_rows: strings(&[".single-car-data table tbody tr", ".single-car-data table tr"]),
            spec_label: strings(&[".t-label", "th"]),
            spec_value: strings(&[".t-value", "td"]),
            main_description: strings(&[".stm-car-options-panel p", ".single-listing-description"]),
            interior_description: strings(&[".interior-description"]),
            exterior_description: strings(&[".exterior-description"]),
            features: strings(&[".stm-car-options-panel li", ".single-listing-features li"]),
            contact_email: strings(&[".contact-email"]),
            contact_phone: strings(&[".contact-phone"]),
            gallery_images: strings(&[".gallery img", ".stm-car-medias img"]),
        }
    }
}

impl SiteProfile {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing site profile yaml")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading site profile {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// URL of catalog index page `page` (1-based).
    pub fn page_url(&self, page: u32) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.page_path.replace("{page}", &page.to_string())
        )
    }
}

fn compile(field: &'static str, selectors: &[String]) -> Result<Vec<Selector>, ExtractError> {
    selectors
        .iter()
        .map(|s| {
            Selector::parse(s).map_err(|e| ExtractError::Selector {
                field,
                selector: s.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// Collapse all whitespace runs to single spaces.
fn clean_text(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Keep line structure for long-form text, dropping blank lines.
fn clean_block(raw: &str) -> Option<String> {
    let lines = raw
        .lines()
        .filter_map(clean_text)
        .collect::<Vec<_>>();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

fn first_text(scope: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|sel| {
        scope
            .select(sel)
            .find_map(|n| clean_text(&element_text(n)))
    })
}

/// First selector in the fallback list that matches any node under `scope`.
fn winning<'s>(scope: ElementRef<'_>, selectors: &'s [Selector]) -> Option<&'s Selector> {
    selectors.iter().find(|sel| scope.select(sel).next().is_some())
}

/// Blocks of every node matched by the first selector that yields text, one per line group.
fn first_block(scope: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|sel| {
        let blocks = scope
            .select(sel)
            .filter_map(|n| clean_block(&element_text(n)))
            .collect::<Vec<_>>();
        (!blocks.is_empty()).then(|| blocks.join("\n"))
    })
}

fn first_attr(scope: ElementRef<'_>, selectors: &[Selector], attr: &str) -> Option<String> {
    selectors.iter().find_map(|sel| {
        scope
            .select(sel)
            .find_map(|n| n.value().attr(attr).and_then(clean_text))
    })
}

/// All texts from the first selector that yields anything.
fn all_texts(scope: ElementRef<'_>, selectors: &[Selector]) -> Vec<String> {
    for sel in selectors {
        let texts = scope
            .select(sel)
            .filter_map(|n| clean_text(&element_text(n)))
            .collect::<Vec<_>>();
        if !texts.is_empty() {
            return texts;
        }
    }
    Vec::new()
}

/// Strip everything except digits and the decimal point; missing or empty input yields `"0"`.
pub fn format_price(raw: Option<&str>) -> String {
    let digits = raw
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect::<String>();
    if digits.is_empty() {
        "0".to_string()
    } else {
        digits
    }
}

/// First `19xx`/`20xx` token in `text`.
pub fn extract_year(text: &str) -> Option<i32> {
    YEAR_RE.find(text).and_then(|m| m.as_str().parse().ok())
}

/// Integer made of every digit in `text`, ignoring separators and units.
pub fn parse_digits(text: &str) -> Option<i64> {
    let digits = text.chars().filter(char::is_ascii_digit).collect::<String>();
    digits.parse().ok()
}

/// `"Interior Color:"` -> `"interior_color"`.
pub fn normalize_spec_key(label: &str) -> String {
    label
        .trim()
        .trim_end_matches(':')
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

pub fn normalize_spec_value(key: &str, raw: &str) -> SpecValue {
    let trimmed = raw.trim();
    if FLAG_KEYS.contains(&key) {
        SpecValue::Flag(trimmed.eq_ignore_ascii_case("yes"))
    } else if INTEGER_KEYS.contains(&key) {
        parse_digits(trimmed).map_or(SpecValue::Null, SpecValue::Integer)
    } else if key == "year" {
        extract_year(trimmed).map_or(SpecValue::Null, |y| SpecValue::Integer(i64::from(y)))
    } else {
        SpecValue::Text(trimmed.to_string())
    }
}

/// Fill gaps in the spec map from the free-text model string.
///
/// `year` is derived only when the table omitted it. A fuel keyword followed by an
/// engine token (`"Diesel Cummins"`) overrides `engine` and sets `fuel_type`.
pub fn enhance_from_model(specs: &mut SpecMap) {
    let Some(model) = specs.get("model").and_then(SpecValue::as_text) else {
        return;
    };

    let has_year = specs.get("year").is_some_and(|v| !v.is_null());
    if !has_year {
        if let Some(year) = extract_year(&model) {
            specs.insert("year".to_string(), SpecValue::Integer(i64::from(year)));
        }
    }

    if let Some(caps) = FUEL_ENGINE_RE.captures(&model) {
        let fuel = caps[1].to_string();
        let engine = caps[2].to_string();
        specs.insert("fuel_type".to_string(), SpecValue::Text(fuel.clone()));
        specs.insert("engine".to_string(), SpecValue::Text(format!("{fuel} {engine}")));
    }
}

pub struct ListingExtractor {
    item: Vec<Selector>,
    title: Vec<Selector>,
    link: Vec<Selector>,
    price: Vec<Selector>,
    pagination: Vec<Selector>,
    base_url: Url,
}

impl ListingExtractor {
    pub fn new(profile: &SiteProfile) -> Result<Self, ExtractError> {
        Ok(Self {
            item: compile("listing_item", &profile.listing_item)?,
            title: compile("listing_title", &profile.listing_title)?,
            link: compile("listing_link", &profile.listing_link)?,
            price: compile("listing_price", &profile.listing_price)?,
            pagination: compile("pagination", &profile.pagination)?,
            base_url: Url::parse(&profile.base_url)
                .map_err(|_| ExtractError::BaseUrl(profile.base_url.clone()))?,
        })
    }

    /// Highest numeric token in the pagination control; `1` when there is none.
    pub fn total_pages(&self, html: &str) -> u32 {
        let document = Html::parse_document(html);
        let root = document.root_element();
        let Some(sel) = winning(root, &self.pagination) else {
            return 1;
        };
        root.select(sel)
            .filter_map(|n| element_text(n).trim().parse::<u32>().ok())
            .max()
            .unwrap_or(1)
            .max(1)
    }

    fn absolutize(&self, href: &str) -> Option<String> {
        self.base_url.join(href).ok().map(String::from)
    }

    /// Listing stubs on one index page. Items missing a title or link are dropped.
    pub fn parse_listing(&self, html: &str) -> Vec<ListingStub> {
        let document = Html::parse_document(html);
        let root = document.root_element();
        let mut stubs = Vec::new();
        let Some(item_sel) = winning(root, &self.item) else {
            debug!("no listing items on page");
            return stubs;
        };

        for item in root.select(item_sel) {
            let title = first_text(item, &self.title);
            let link = first_attr(item, &self.link, "href").and_then(|h| self.absolutize(&h));
            let price = format_price(first_text(item, &self.price).as_deref());

            match (title, link) {
                (Some(title), Some(detail_url)) => stubs.push(ListingStub {
                    title,
                    price,
                    detail_url,
                }),
                (title, link) => {
                    warn!(?title, ?link, "dropping listing item missing title or detail link");
                }
            }
        }

        debug!(count = stubs.len(), "parsed listing page");
        stubs
    }
}

pub struct DetailExtractor {
    root: Vec<Selector>,
    spec_rows: Vec<Selector>,
    spec_label: Vec<Selector>,
    spec_value: Vec<Selector>,
    main_description: Vec<Selector>,
    interior_description: Vec<Selector>,
    exterior_description: Vec<Selector>,
    features: Vec<Selector>,
    contact_email: Vec<Selector>,
    contact_phone: Vec<Selector>,
    gallery_images: Vec<Selector>,
    cells: Selector,
    mailto: Selector,
    tel: Selector,
}

impl DetailExtractor {
    pub fn new(profile: &SiteProfile) -> Result<Self, ExtractError> {
        let fixed = |s: &str| compile("builtin", &[s.to_string()]).map(|mut v| v.remove(0));
        Ok(Self {
            root: compile("detail_root", &profile.detail_root)?,
            spec_rows: compile("spec_rows", &profile.spec_rows)?,
            spec_label: compile("spec_label", &profile.spec_label)?,
            spec_value: compile("spec_value", &profile.spec_value)?,
            main_description: compile("main_description", &profile.main_description)?,
            interior_description: compile("interior_description", &profile.interior_description)?,
            exterior_description: compile("exterior_description", &profile.exterior_description)?,
            features: compile("features", &profile.features)?,
            contact_email: compile("contact_email", &profile.contact_email)?,
            contact_phone: compile("contact_phone", &profile.contact_phone)?,
            gallery_images: compile("gallery_images", &profile.gallery_images)?,
            cells: fixed("td")?,
            mailto: fixed(r#"a[href^="mailto:"]"#)?,
            tel: fixed(r#"a[href^="tel:"]"#)?,
        })
    }

    /// Raw field map for one detail page, or `None` when the page has no content element.
    pub fn parse_detail(&self, html: &str) -> Option<DetailFields> {
        let document = Html::parse_document(html);
        let root = document.root_element();
        if winning(root, &self.root).is_none() {
            return None;
        }

        let mut specs = self.spec_table(root);
        enhance_from_model(&mut specs);

        Some(DetailFields {
            specs,
            main_description: first_block(root, &self.main_description),
            interior_description: first_block(root, &self.interior_description),
            exterior_description: first_block(root, &self.exterior_description),
            features: all_texts(root, &self.features),
            vin: self.labeled_value(root, "VIN"),
            dimensions: self.labeled_value(root, "Dimensions"),
            luggage: self
                .labeled_value(root, "Luggage")
                .is_some_and(|v| v.eq_ignore_ascii_case("yes")),
            state_bus_standard: self.labeled_value(root, "State Bus Standard"),
            contact_email: first_text(root, &self.contact_email).or_else(|| {
                first_attr(root, std::slice::from_ref(&self.mailto), "href")
                    .map(|h| h.trim_start_matches("mailto:").to_string())
            }),
            contact_phone: first_text(root, &self.contact_phone).or_else(|| {
                first_attr(root, std::slice::from_ref(&self.tel), "href")
                    .map(|h| h.trim_start_matches("tel:").to_string())
            }),
            images: self.images(root),
        })
    }

    fn spec_table(&self, root: ElementRef<'_>) -> SpecMap {
        let mut specs = SpecMap::new();
        let Some(rows_sel) = winning(root, &self.spec_rows) else {
            return specs;
        };

        for row in root.select(rows_sel) {
            let label = first_text(row, &self.spec_label);
            let value = self
                .spec_value
                .iter()
                .find_map(|sel| row.select(sel).last().and_then(|n| clean_text(&element_text(n))));
            if let (Some(label), Some(value)) = (label, value) {
                let key = normalize_spec_key(&label);
                let normalized = normalize_spec_value(&key, &value);
                specs.insert(key, normalized);
            }
        }
        specs
    }

    /// Text of the cell following a cell whose text equals `label`.
    fn labeled_value(&self, root: ElementRef<'_>, label: &str) -> Option<String> {
        root.select(&self.cells)
            .find(|td| {
                clean_text(&element_text(*td)).is_some_and(|t| t.eq_ignore_ascii_case(label))
            })
            .and_then(|td| td.next_siblings().find_map(ElementRef::wrap))
            .and_then(|next| clean_text(&element_text(next)))
    }

    fn images(&self, root: ElementRef<'_>) -> Vec<ImageRef> {
        for sel in &self.gallery_images {
            let images = root
                .select(sel)
                .filter_map(|img| {
                    let el = img.value();
                    let url = el
                        .attr("src")
                        .and_then(clean_text)
                        .or_else(|| el.attr("data-src").and_then(clean_text))?;
                    Some(ImageRef {
                        url,
                        alt: el.attr("alt").map(|a| a.trim().to_string()).unwrap_or_default(),
                    })
                })
                .collect::<Vec<_>>();
            if !images.is_empty() {
                return images;
            }
        }
        Vec::new()
    }
}

/// Compiled extractors for one catalog site.
pub struct CatalogAdapter {
    profile: SiteProfile,
    listing: ListingExtractor,
    detail: DetailExtractor,
}

impl CatalogAdapter {
    pub fn new(profile: SiteProfile) -> Result<Self, ExtractError> {
        Ok(Self {
            listing: ListingExtractor::new(&profile)?,
            detail: DetailExtractor::new(&profile)?,
            profile,
        })
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }

    pub fn page_url(&self, page: u32) -> String {
        self.profile.page_url(page)
    }

    /// Host of the catalog, recorded as the `source` of every record.
    pub fn source_name(&self) -> Option<String> {
        self.listing.base_url.host_str().map(ToString::to_string)
    }

    pub fn total_pages(&self, html: &str) -> u32 {
        self.listing.total_pages(html)
    }

    pub fn parse_listing(&self, html: &str) -> Vec<ListingStub> {
        self.listing.parse_listing(html)
    }

    pub fn parse_detail(&self, html: &str) -> Option<DetailFields> {
        self.detail.parse_detail(html)
    }

    /// Fetch and parse one detail page. `Ok(None)` means the page had no content.
    pub async fn fetch_detail(
        &self,
        http: &dyn PageSource,
        url: &str,
    ) -> Result<Option<DetailFields>, FetchError> {
        let html = http.fetch_text(url).await?;
        let fields = self.parse_detail(&html);
        if fields.is_none() {
            warn!(url, "detail page has no content element");
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> String {
        let path = workspace_root().join("fixtures/centralstates").join(name);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn adapter() -> CatalogAdapter {
        CatalogAdapter::new(SiteProfile::default()).unwrap()
    }

    #[test]
    fn format_price_keeps_digits_and_decimal_point() {
        assert_eq!(format_price(Some("$12,345.67")), "12345.67");
        assert_eq!(format_price(Some("")), "0");
        assert_eq!(format_price(None), "0");
        assert_eq!(format_price(Some("Call for price")), "0");
    }

    #[test]
    fn extract_year_finds_first_plausible_year() {
        assert_eq!(extract_year("2020 Ford Transit"), Some(2020));
        assert_eq!(extract_year("Transit Van"), None);
        assert_eq!(extract_year("Model 3500, built 1998"), Some(1998));
        assert_eq!(extract_year("E450 21500"), None);
    }

    #[test]
    fn spec_values_follow_field_rules() {
        assert_eq!(normalize_spec_key(" Wheel Chair  Accessible: "), "wheel_chair_accessible");
        assert_eq!(normalize_spec_value("air_conditioning", "YES"), SpecValue::Flag(true));
        assert_eq!(normalize_spec_value("wheel_chair_accessible", "No"), SpecValue::Flag(false));
        assert_eq!(normalize_spec_value("mileage", "123,456 mi"), SpecValue::Integer(123_456));
        assert_eq!(normalize_spec_value("capacity", "n/a"), SpecValue::Null);
        assert_eq!(normalize_spec_value("year", "Model year 2017"), SpecValue::Integer(2017));
        assert_eq!(normalize_spec_value("year", "unknown"), SpecValue::Null);
        assert_eq!(
            normalize_spec_value("make", "  Ford "),
            SpecValue::Text("Ford".to_string())
        );
    }

    #[test]
    fn model_enhancement_fills_year_and_engine() {
        let mut specs = SpecMap::new();
        specs.insert("model".into(), SpecValue::Text("2016 E450 Diesel Cummins-6.7".into()));
        specs.insert("engine".into(), SpecValue::Text("V8".into()));
        enhance_from_model(&mut specs);
        assert_eq!(specs["year"], SpecValue::Integer(2016));
        assert_eq!(specs["fuel_type"], SpecValue::Text("Diesel".into()));
        assert_eq!(specs["engine"], SpecValue::Text("Diesel Cummins-6.7".into()));

        let mut kept = SpecMap::new();
        kept.insert("model".into(), SpecValue::Text("2016 Transit".into()));
        kept.insert("year".into(), SpecValue::Integer(2018));
        enhance_from_model(&mut kept);
        assert_eq!(kept["year"], SpecValue::Integer(2018));
        assert!(!kept.contains_key("engine"));
    }

    #[test]
    fn pagination_uses_highest_numeric_token() {
        let html = r#"<div class="stm_ajax_pagination">
            <span class="page-numbers current">1</span>
            <a class="page-numbers" href="/page/2/">2</a>
            <a class="page-numbers" href="/page/3/">3</a>
            <a class="next page-numbers" href="/page/2/">Next</a>
        </div>"#;
        assert_eq!(adapter().total_pages(html), 3);
        assert_eq!(adapter().total_pages("<html><body><p>no pager</p></body></html>"), 1);

        let ellipsis = r#"<div class="stm_ajax_pagination">
            <span class="page-numbers">1</span><span class="page-numbers dots">…</span>
            <a class="page-numbers">12</a><a class="page-numbers">Next</a></div>"#;
        assert_eq!(adapter().total_pages(ellipsis), 12);
    }

    #[test]
    fn index_page_yields_complete_stubs_only() {
        let html = fixture("index_page_1.html");
        let adapter = adapter();
        assert_eq!(adapter.total_pages(&html), 3);

        let stubs = adapter.parse_listing(&html);
        assert_eq!(
            stubs,
            vec![
                ListingStub {
                    title: "2018 Ford E450 Champion Challenger".into(),
                    price: "54900".into(),
                    detail_url: "https://www.centralstatesbus.com/listings/2018-ford-e450-champion/".into(),
                },
                ListingStub {
                    title: "2015 Chevrolet 4500 Glaval Titan".into(),
                    price: "0".into(),
                    detail_url: "https://www.centralstatesbus.com/listings/2015-chevrolet-glaval-titan/".into(),
                },
            ]
        );
    }

    #[test]
    fn fallback_item_selector_is_ignored_when_primary_matches() {
        let profile = SiteProfile {
            listing_item: vec![
                ".listing-list-loop".to_string(),
                ".stm-listing-directory-list-loop".to_string(),
            ],
            ..SiteProfile::default()
        };
        let layered = CatalogAdapter::new(profile).unwrap();
        let stubs = layered.parse_listing(&fixture("index_page_1.html"));
        assert_eq!(stubs, adapter().parse_listing(&fixture("index_page_1.html")));
        assert_eq!(stubs.len(), 2);

        let fallback_only = SiteProfile {
            listing_item: vec![".absent".to_string(), ".stm-isotope-listing-item".to_string()],
            ..SiteProfile::default()
        };
        let stubs = CatalogAdapter::new(fallback_only)
            .unwrap()
            .parse_listing(&fixture("index_page_1.html"));
        assert_eq!(stubs.len(), 2);
    }

    #[test]
    fn main_description_joins_every_matched_paragraph() {
        let html = r#"<html><body><div class="stm-single-car-page">
            <div class="stm-car-options-panel">
                <p>Runs and drives great.</p>
                <p>Recent brake job.</p>
            </div>
            <div class="single-listing-description"><p>Ignored wrapper.</p></div>
        </div></body></html>"#;
        let fields = adapter().parse_detail(html).unwrap();
        assert_eq!(
            fields.main_description.as_deref(),
            Some("Runs and drives great.\nRecent brake job.")
        );
    }

    #[test]
    fn detail_page_matches_golden_snapshot() {
        let fields = adapter().parse_detail(&fixture("detail_full.html")).unwrap();
        let expected: DetailFields =
            serde_json::from_str(&fixture("detail_snapshot.json")).expect("parse snapshot");
        assert_eq!(fields, expected);
    }

    #[test]
    fn description_falls_back_to_wrapper_and_missing_table_leaves_specs_empty() {
        let fields = adapter().parse_detail(&fixture("detail_no_specs.html")).unwrap();
        assert!(fields.specs.is_empty());
        assert_eq!(
            fields.main_description.as_deref(),
            Some("Well kept shuttle, serviced every 5,000 miles.\nNew tires in 2023.")
        );
        assert!(fields.features.is_empty());
        assert_eq!(fields.contact_email.as_deref(), Some("sales@centralstatesbus.com"));
        assert_eq!(fields.contact_phone.as_deref(), Some("+1-800-555-0100"));
        assert_eq!(
            fields.images,
            vec![ImageRef {
                url: "https://cdn.centralstatesbus.com/titan-front.jpg".into(),
                alt: String::new(),
            }]
        );
    }

    #[test]
    fn page_without_content_element_yields_none() {
        assert!(adapter().parse_detail(&fixture("detail_empty.html")).is_none());
    }

    #[test]
    fn yaml_profile_overrides_selectors_and_keeps_defaults() {
        let profile = SiteProfile::from_yaml_str(
            "base_url: https://mirror.example.test/\nlisting_price: ['.cost']\n",
        )
        .unwrap();
        assert_eq!(profile.listing_price, vec![".cost".to_string()]);
        assert_eq!(profile.detail_root, SiteProfile::default().detail_root);
        assert_eq!(
            profile.page_url(4),
            "https://mirror.example.test/page/4/?posts_per_page=10"
        );
    }

    #[test]
    fn checked_in_site_profile_matches_builtin_default() {
        let profile = SiteProfile::load(workspace_root().join("site.yaml")).unwrap();
        assert_eq!(profile, SiteProfile::default());
    }

    #[test]
    fn invalid_selector_is_rejected_at_construction() {
        let profile = SiteProfile {
            listing_item: vec!["div[[".to_string()],
            ..SiteProfile::default()
        };
        assert!(matches!(
            CatalogAdapter::new(profile),
            Err(ExtractError::Selector { field: "listing_item", .. })
        ));
    }

    struct FixturePages(HashMap<String, String>);

    #[async_trait::async_trait]
    impl PageSource for FixturePages {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            self.0.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn fetch_detail_distinguishes_missing_content_from_fetch_failure() {
        let pages = FixturePages(HashMap::from([
            ("https://x.test/full".to_string(), fixture("detail_full.html")),
            ("https://x.test/empty".to_string(), fixture("detail_empty.html")),
        ]));
        let adapter = adapter();
        assert!(adapter.fetch_detail(&pages, "https://x.test/full").await.unwrap().is_some());
        assert!(adapter.fetch_detail(&pages, "https://x.test/empty").await.unwrap().is_none());
        assert!(adapter.fetch_detail(&pages, "https://x.test/gone").await.is_err());
    }
}
