use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::RdaError;

pub const DATE_FORMAT: &str = "%Y%m%d%H%M";
const DATE_WIDTH: usize = 12;

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, RdaError> {
    let trimmed = value.trim();
    if trimmed.is_empty()
        || trimmed.len() > DATE_WIDTH
        || !trimmed.chars().all(|ch| ch.is_ascii_digit())
    {
        return Err(RdaError::InvalidTimestamp(value.to_string()));
    }
    let padded = format!("{trimmed:0>width$}", width = DATE_WIDTH);
    NaiveDateTime::parse_from_str(&padded, DATE_FORMAT)
        .map_err(|_| RdaError::InvalidTimestamp(value.to_string()))
}

pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

impl BoundingBox {
    pub fn new(south: f64, north: f64, west: f64, east: f64) -> Result<Self, RdaError> {
        let bbox = Self {
            south,
            north,
            west,
            east,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    fn validate(&self) -> Result<(), RdaError> {
        let values = [self.south, self.north, self.west, self.east];
        if values.iter().any(|value| !value.is_finite()) {
            return Err(RdaError::InvalidBoundingBox(format!(
                "non-finite coordinate in {self}"
            )));
        }
        if !(-90.0..=90.0).contains(&self.south) || !(-90.0..=90.0).contains(&self.north) {
            return Err(RdaError::InvalidBoundingBox(format!(
                "latitude out of range in {self}"
            )));
        }
        if self.south > self.north {
            return Err(RdaError::InvalidBoundingBox(format!(
                "south latitude is north of north latitude in {self}"
            )));
        }
        if !(-180.0..=360.0).contains(&self.west) || !(-180.0..=360.0).contains(&self.east) {
            return Err(RdaError::InvalidBoundingBox(format!(
                "longitude out of range in {self}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.south, self.north, self.west, self.east)
    }
}

impl FromStr for BoundingBox {
    type Err = RdaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| RdaError::InvalidBoundingBox(value.to_string()))?;
        match parts.as_slice() {
            [south, north, west, east] => Self::new(*south, *north, *west, *east),
            _ => Err(RdaError::InvalidBoundingBox(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetQuery {
    dataset: String,
    product: String,
    params: Vec<String>,
    start: NaiveDateTime,
    end: NaiveDateTime,
    bbox: BoundingBox,
}

impl DatasetQuery {
    pub fn new(
        dataset: impl Into<String>,
        product: impl Into<String>,
        params: Vec<String>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        bbox: BoundingBox,
    ) -> Result<Self, RdaError> {
        let dataset = dataset.into().trim().to_string();
        let product = product.into().trim().to_string();
        if dataset.is_empty() {
            return Err(RdaError::InvalidQuery("dataset name is empty".to_string()));
        }
        if product.is_empty() {
            return Err(RdaError::InvalidQuery("product name is empty".to_string()));
        }
        let unsafe_segment =
            |name: &str| name.contains(['/', '\\']) || name == "." || name == "..";
        if unsafe_segment(&dataset) || unsafe_segment(&product) {
            return Err(RdaError::InvalidQuery(format!(
                "dataset and product must be plain directory names: {dataset}/{product}"
            )));
        }

        let mut ordered = Vec::with_capacity(params.len());
        for param in params {
            let param = param.trim().to_string();
            if !param.is_empty() && !ordered.contains(&param) {
                ordered.push(param);
            }
        }
        if ordered.is_empty() {
            return Err(RdaError::InvalidQuery(
                "at least one parameter is required".to_string(),
            ));
        }
        if start > end {
            return Err(RdaError::InvalidQuery(format!(
                "start {} is after end {}",
                format_timestamp(&start),
                format_timestamp(&end)
            )));
        }
        bbox.validate()?;

        Ok(Self {
            dataset,
            product,
            params: ordered,
            start,
            end,
            bbox,
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn time_range(&self) -> String {
        format!(
            "{}-{}",
            format_timestamp(&self.start),
            format_timestamp(&self.end)
        )
    }
}

#[derive(Clone)]
pub struct Credentials {
    identifier: String,
    secret: String,
}

impl Credentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Result<Self, RdaError> {
        let identifier = identifier.into();
        let secret = secret.into();
        if identifier.trim().is_empty() || secret.is_empty() {
            return Err(RdaError::MissingCredentials);
        }
        Ok(Self { identifier, secret })
    }

    pub fn from_env() -> Result<Self, RdaError> {
        let identifier = std::env::var("RDA_EMAIL").map_err(|_| RdaError::MissingCredentials)?;
        let secret = std::env::var("RDA_PASSWORD").map_err(|_| RdaError::MissingCredentials)?;
        Self::new(identifier, secret)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_timestamp_pads_short_values() {
        let ts = parse_timestamp("11701010000").unwrap();
        assert_eq!(format_timestamp(&ts), "011701010000");
    }

    #[test]
    fn parse_timestamp_rejects_garbage() {
        assert_matches!(
            parse_timestamp("2024-01-01"),
            Err(RdaError::InvalidTimestamp(_))
        );
        assert_matches!(
            parse_timestamp("202413010000"),
            Err(RdaError::InvalidTimestamp(_))
        );
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = Credentials::new("me@example.org", "hunter2").unwrap();
        let debug = format!("{creds:?}");
        assert!(debug.contains("me@example.org"));
        assert!(!debug.contains("hunter2"));
    }
}
