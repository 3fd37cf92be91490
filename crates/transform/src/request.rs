//! Transformation request payloads.

use geoflip_core::error::CoreError;
use geoflip_core::export::{
    validate_output_format, FORMAT_DXF, FORMAT_GEOPACKAGE, FORMAT_SHAPEFILE,
};
use serde::{Deserialize, Serialize};

/// Input formats accepted by the versioned upload endpoints.
pub const VALID_INPUT_FORMATS: &[&str] =
    &[FORMAT_SHAPEFILE, FORMAT_GEOPACKAGE, FORMAT_DXF, "geojson"];

/// Units accepted by the buffer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    Meters,
    Kilometers,
    Feet,
    Miles,
}

/// One step of a transformation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transformation {
    Buffer { distance: f64, units: DistanceUnit },
    Union,
    Erase { erasing_geojson: serde_json::Value },
    Clip { clipping_geojson: serde_json::Value },
}

/// The `config` part of an upload request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub output_format: String,
    /// Target CRS, e.g. `EPSG:4326`.
    pub output_crs: String,
    /// Source CRS; only meaningful for DXF inputs, which carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_crs: Option<String>,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
}

impl PipelineConfig {
    /// Build a config for `input_format` → `output_format`.
    ///
    /// `input_epsg` is dropped unless the input is DXF.
    pub fn new(
        input_format: &str,
        output_format: &str,
        output_epsg: u32,
        input_epsg: Option<u32>,
    ) -> Result<Self, CoreError> {
        validate_output_format(output_format)?;
        if output_epsg == 0 {
            return Err(CoreError::Validation("Output EPSG code must be positive".into()));
        }
        let input_crs = match input_epsg {
            Some(0) => {
                return Err(CoreError::Validation("Input EPSG code must be positive".into()))
            }
            Some(code) if input_format == FORMAT_DXF => Some(epsg(code)),
            _ => None,
        };

        Ok(Self {
            output_format: output_format.to_string(),
            output_crs: epsg(output_epsg),
            input_crs,
            transformations: Vec::new(),
        })
    }

    /// Append a transformation step.
    pub fn with_step(mut self, step: Transformation) -> Self {
        self.transformations.push(step);
        self
    }

    /// Check step parameters the server would otherwise reject.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_output_format(&self.output_format)?;
        for step in &self.transformations {
            if let Transformation::Buffer { distance, .. } = step {
                if !distance.is_finite() {
                    return Err(CoreError::Validation(
                        "Buffer distance must be a finite number".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn epsg(code: u32) -> String {
    format!("EPSG:{code}")
}

/// Which submission endpoint a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `POST /v1/transform/{input_format}?async=true`
    Versioned { input_format: String },
    /// `POST /transform`
    Legacy,
}

/// An uploaded file plus its pipeline configuration.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub endpoint: Endpoint,
    pub file_name: String,
    pub file: Vec<u8>,
    pub config: PipelineConfig,
}

impl TransformRequest {
    /// Request against the versioned endpoint for `input_format`.
    pub fn versioned(
        input_format: impl Into<String>,
        file_name: impl Into<String>,
        file: Vec<u8>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            endpoint: Endpoint::Versioned {
                input_format: input_format.into(),
            },
            file_name: file_name.into(),
            file,
            config,
        }
    }

    /// Request against the legacy `/transform` endpoint.
    pub fn legacy(file_name: impl Into<String>, file: Vec<u8>, config: PipelineConfig) -> Self {
        Self {
            endpoint: Endpoint::Legacy,
            file_name: file_name.into(),
            file,
            config,
        }
    }

    pub fn output_format(&self) -> &str {
        &self.config.output_format
    }

    /// Validate the request before it is sent.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Endpoint::Versioned { input_format } = &self.endpoint {
            if !VALID_INPUT_FORMATS.contains(&input_format.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Unknown input format: '{input_format}'. Valid formats: {}",
                    VALID_INPUT_FORMATS.join(", ")
                )));
            }
        }
        if self.file.is_empty() {
            return Err(CoreError::Validation("Input file is empty".into()));
        }
        self.config.validate()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn config_serializes_like_the_upload_form() {
        let config = PipelineConfig::new("shp", "gpkg", 4326, Some(3857))
            .unwrap()
            .with_step(Transformation::Buffer {
                distance: 25.0,
                units: DistanceUnit::Meters,
            })
            .with_step(Transformation::Union);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "output_format": "gpkg",
                "output_crs": "EPSG:4326",
                "transformations": [
                    {"type": "buffer", "distance": 25.0, "units": "meters"},
                    {"type": "union"},
                ],
            })
        );
    }

    #[test]
    fn input_crs_only_for_dxf() {
        let config = PipelineConfig::new("dxf", "shp", 4326, Some(28356)).unwrap();
        assert_eq!(config.input_crs.as_deref(), Some("EPSG:28356"));
    }

    #[test]
    fn rejects_bad_formats_and_codes() {
        assert_matches!(
            PipelineConfig::new("shp", "kml", 4326, None),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            PipelineConfig::new("shp", "gpkg", 0, None),
            Err(CoreError::Validation(_))
        );

        let config = PipelineConfig::new("shp", "gpkg", 4326, None).unwrap();
        let request = TransformRequest::versioned("kml", "a.kml", vec![1], config.clone());
        assert_matches!(request.validate(), Err(CoreError::Validation(_)));

        let request = TransformRequest::versioned("shp", "a.zip", Vec::new(), config);
        assert_matches!(request.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn erase_step_carries_geojson() {
        let step = Transformation::Erase {
            erasing_geojson: serde_json::json!({"type": "FeatureCollection", "features": []}),
        };
        let json = serde_json::to_value(step).unwrap();
        assert_eq!(json["type"], "erase");
        assert_eq!(json["erasing_geojson"]["type"], "FeatureCollection");
    }
}
