//! Listing stub + detail field map -> canonical record with owned children.

use busharvest_core::{
    AirConditioning, AssembledBus, Bus, BusImage, BusOverview, DetailFields, ListingStub,
    SpecValue, UsRegion,
};
use tracing::{debug, warn};

use crate::store::IMAGE_NAME_MAX_CHARS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Year,
    Make,
    Model,
    Body,
    Chassis,
    Engine,
    Transmission,
    Mileage,
    Passengers,
    Wheelchair,
    Color,
    InteriorColor,
    ExteriorColor,
    Gvwr,
    Brake,
    AirConditioning,
    Location,
    Vin,
    Dimensions,
}

/// Normalized spec key -> record field. Keys absent here never reach the record.
const SPEC_FIELDS: &[(&str, Field)] = &[
    ("year", Field::Year),
    ("make", Field::Make),
    ("model", Field::Model),
    ("body", Field::Body),
    ("chassis", Field::Chassis),
    ("engine", Field::Engine),
    ("transmission", Field::Transmission),
    ("mileage", Field::Mileage),
    ("passengers", Field::Passengers),
    ("capacity", Field::Passengers),
    ("wheel_chair_accessible", Field::Wheelchair),
    ("color", Field::Color),
    ("interior_color", Field::InteriorColor),
    ("exterior_color", Field::ExteriorColor),
    ("gvwr", Field::Gvwr),
    ("brake", Field::Brake),
    ("brakes", Field::Brake),
    ("air_conditioning", Field::AirConditioning),
    ("location", Field::Location),
    ("vin", Field::Vin),
    ("dimensions", Field::Dimensions),
];

fn field_for(key: &str) -> Option<Field> {
    SPEC_FIELDS
        .iter()
        .find_map(|(k, field)| (*k == key).then_some(*field))
}

fn non_empty(value: &str) -> bool {
    !value.trim().is_empty()
}

fn image_name(title: &str, position: usize) -> String {
    format!("{title} Image {position}")
        .chars()
        .take(IMAGE_NAME_MAX_CHARS)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RecordAssembler {
    source: Option<String>,
}

impl RecordAssembler {
    /// `source` is stamped on every record, normally the catalog host.
    pub fn new(source: Option<String>) -> Self {
        Self { source }
    }

    /// `None` when title, price or source URL is empty.
    pub fn assemble(&self, stub: &ListingStub, detail: DetailFields) -> Option<AssembledBus> {
        if !(non_empty(&stub.title) && non_empty(&stub.price) && non_empty(&stub.detail_url)) {
            warn!(url = %stub.detail_url, title = %stub.title, "discarding record missing a required field");
            return None;
        }

        let mut bus = Bus::new(stub.title.trim(), stub.price.trim(), stub.detail_url.trim());
        bus.source = self.source.clone();

        for (key, value) in &detail.specs {
            match field_for(key) {
                Some(field) => apply_spec(&mut bus, field, value),
                None => debug!(key, url = %bus.source_url, "ignoring unmapped spec key"),
            }
        }

        // Label-located cells win over same-named spec table rows.
        if detail.vin.is_some() {
            bus.vin = detail.vin.clone();
        }
        if detail.dimensions.is_some() {
            bus.dimensions = detail.dimensions.clone();
        }
        bus.luggage = detail.luggage;
        bus.state_bus_standard = detail.state_bus_standard.clone();
        bus.contact_email = detail.contact_email.clone();
        bus.contact_phone = detail.contact_phone.clone();
        bus.description = detail.main_description.clone();

        let overview = BusOverview {
            mdesc: detail.main_description,
            intdesc: detail.interior_description,
            extdesc: detail.exterior_description,
            features: serde_json::to_string(&detail.features).ok(),
            specs: serde_json::to_string(&detail.specs).ok(),
        };

        let images = detail
            .images
            .into_iter()
            .enumerate()
            .map(|(idx, image)| BusImage {
                name: image_name(&bus.title, idx + 1),
                url: image.url,
                description: image.alt,
                image_index: i32::try_from(idx).unwrap_or(i32::MAX),
            })
            .collect();

        Some(AssembledBus {
            bus,
            overview,
            images,
        })
    }
}

fn apply_spec(bus: &mut Bus, field: Field, value: &SpecValue) {
    let text = value.as_text();
    match field {
        Field::Year => bus.year = text,
        Field::Make => bus.make = text,
        Field::Model => bus.model = text,
        Field::Body => bus.body = text,
        Field::Chassis => bus.chassis = text,
        Field::Engine => bus.engine = text,
        Field::Transmission => bus.transmission = text,
        Field::Mileage => bus.mileage = text,
        Field::Passengers => {
            if text.is_some() {
                bus.passengers = text;
            }
        }
        Field::Wheelchair => {
            bus.wheelchair = value
                .as_flag()
                .map(|flag| if flag { "Yes" } else { "No" }.to_string());
        }
        Field::Color => bus.color = text,
        Field::InteriorColor => bus.interior_color = text,
        Field::ExteriorColor => bus.exterior_color = text,
        Field::Gvwr => bus.gvwr = text,
        Field::Brake => bus.brake = text,
        Field::AirConditioning => {
            bus.airconditioning = AirConditioning::from_flag(value.as_flag().unwrap_or(false));
        }
        Field::Location => {
            bus.us_region = text
                .as_deref()
                .map_or(UsRegion::Other, UsRegion::from_location);
            bus.location = text;
        }
        Field::Vin => bus.vin = text,
        Field::Dimensions => bus.dimensions = text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busharvest_core::{ImageRef, SpecMap};

    fn stub() -> ListingStub {
        ListingStub {
            title: "2018 Ford E450 Champion Challenger".into(),
            price: "54900".into(),
            detail_url: "https://www.centralstatesbus.com/listings/2018-ford-e450-champion/".into(),
        }
    }

    fn specs(entries: &[(&str, SpecValue)]) -> SpecMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn allow_listed_keys_map_and_unknown_keys_are_ignored() {
        let detail = DetailFields {
            specs: specs(&[
                ("make", SpecValue::Text("Ford".into())),
                ("mileage", SpecValue::Integer(120_000)),
                ("capacity", SpecValue::Integer(24)),
                ("wheel_chair_accessible", SpecValue::Flag(true)),
                ("air_conditioning", SpecValue::Flag(true)),
                ("location", SpecValue::Text("Kansas City, MO".into())),
                ("stock_number", SpecValue::Text("CS-1182".into())),
            ]),
            ..DetailFields::default()
        };

        let assembled = RecordAssembler::new(Some("www.centralstatesbus.com".into()))
            .assemble(&stub(), detail)
            .unwrap();
        let bus = assembled.bus;
        assert_eq!(bus.make.as_deref(), Some("Ford"));
        assert_eq!(bus.mileage.as_deref(), Some("120000"));
        assert_eq!(bus.passengers.as_deref(), Some("24"));
        assert_eq!(bus.wheelchair.as_deref(), Some("Yes"));
        assert_eq!(bus.airconditioning, AirConditioning::Dash);
        assert_eq!(bus.us_region, UsRegion::Midwest);
        assert_eq!(bus.source.as_deref(), Some("www.centralstatesbus.com"));
        assert_eq!(bus.score, 0);
        assert!(!bus.published);
    }

    #[test]
    fn missing_detail_data_yields_defaults() {
        let assembled = RecordAssembler::default()
            .assemble(&stub(), DetailFields::default())
            .unwrap();
        let expected = Bus::new(
            "2018 Ford E450 Champion Challenger",
            "54900",
            "https://www.centralstatesbus.com/listings/2018-ford-e450-champion/",
        );
        assert_eq!(assembled.bus, expected);
        assert_eq!(assembled.bus.airconditioning, AirConditioning::None);
        assert_eq!(assembled.bus.us_region, UsRegion::Other);
        assert_eq!(assembled.overview.specs.as_deref(), Some("{}"));
        assert_eq!(assembled.overview.features.as_deref(), Some("[]"));
        assert!(assembled.images.is_empty());
    }

    #[test]
    fn required_fields_gate_assembly() {
        let assembler = RecordAssembler::default();
        let mut blank_title = stub();
        blank_title.title = "  ".into();
        assert!(assembler.assemble(&blank_title, DetailFields::default()).is_none());

        let mut blank_price = stub();
        blank_price.price = String::new();
        assert!(assembler.assemble(&blank_price, DetailFields::default()).is_none());
    }

    #[test]
    fn images_are_named_indexed_and_truncated() {
        let mut long = stub();
        long.title = "2012 International 3000 Thomas Saf-T-Liner C2 Activity Bus Wheelchair".into();
        let detail = DetailFields {
            images: vec![
                ImageRef {
                    url: "https://cdn.test/a.jpg".into(),
                    alt: "front".into(),
                },
                ImageRef {
                    url: "https://cdn.test/b.jpg".into(),
                    alt: String::new(),
                },
            ],
            ..DetailFields::default()
        };
        let images = RecordAssembler::default().assemble(&long, detail).unwrap().images;
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].image_index, 0);
        assert_eq!(images[1].image_index, 1);
        assert_eq!(images[0].description, "front");
        assert_eq!(images[0].name.chars().count(), IMAGE_NAME_MAX_CHARS);
        assert!(images[1].name.starts_with("2012 International 3000"));

        let short = RecordAssembler::default()
            .assemble(
                &stub(),
                DetailFields {
                    images: vec![ImageRef {
                        url: "https://cdn.test/a.jpg".into(),
                        alt: String::new(),
                    }],
                    ..DetailFields::default()
                },
            )
            .unwrap();
        assert_eq!(short.images[0].name, "2018 Ford E450 Champion Challenger Image 1");
    }

    #[test]
    fn label_cells_override_spec_rows() {
        let detail = DetailFields {
            specs: specs(&[("vin", SpecValue::Text("FROM-TABLE".into()))]),
            vin: Some("1FDFE4FS0JDC12345".into()),
            luggage: true,
            state_bus_standard: Some("Missouri".into()),
            ..DetailFields::default()
        };
        let bus = RecordAssembler::default().assemble(&stub(), detail).unwrap().bus;
        assert_eq!(bus.vin.as_deref(), Some("1FDFE4FS0JDC12345"));
        assert!(bus.luggage);
        assert_eq!(bus.state_bus_standard.as_deref(), Some("Missouri"));
    }
}
