//! Satellite catalog: per-sensor band assignments, cloud masks,
//! reflectance rescaling and composite display ranges.
//!
//! Every sensor-specific detail lives in [`CATALOG`]. The compositor and
//! every request handler go through [`lookup`], so supporting a new sensor
//! means adding one [`SatelliteProfile`] entry and, if it has a UI label,
//! one [`LABELS`] row.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Spectral index computed as a normalized difference of two bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectralIndex {
    #[serde(rename = "NDVI")]
    Ndvi,
    #[serde(rename = "NBR")]
    Nbr,
}

impl SpectralIndex {
    pub const ALL: [SpectralIndex; 2] = [SpectralIndex::Ndvi, SpectralIndex::Nbr];

    /// Band name the index raster carries.
    pub fn band_name(self) -> &'static str {
        match self {
            SpectralIndex::Ndvi => "NDVI",
            SpectralIndex::Nbr => "NBR",
        }
    }
}

impl fmt::Display for SpectralIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.band_name())
    }
}

impl FromStr for SpectralIndex {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NDVI" => Ok(SpectralIndex::Ndvi),
            "NBR" => Ok(SpectralIndex::Nbr),
            other => bail!("unsupported index: {} (expected NDVI or NBR)", other),
        }
    }
}

/// Numerator and denominator bands of a normalized difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandPair {
    pub numerator: &'static str,
    pub denominator: &'static str,
}

impl BandPair {
    pub fn as_array(&self) -> [&'static str; 2] {
        [self.numerator, self.denominator]
    }
}

/// Per-pixel exclusion of cloud and shadow observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CloudMask {
    /// Keep pixels whose quality band has every listed bit cleared.
    QaBits {
        band: &'static str,
        bits: &'static [u8],
    },
}

/// Conversion from stored digital numbers to surface reflectance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rescale {
    /// `reflectance = dn * gain + offset`
    Linear { gain: f64, offset: f64 },
}

/// Display range and color ramp of an index composite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexStretch {
    pub min: f64,
    pub max: f64,
    pub palette: &'static [&'static str],
}

/// Everything the compositor needs to know about one imagery source.
#[derive(Debug, Clone, PartialEq)]
pub struct SatelliteProfile {
    pub key: &'static str,
    pub collection_id: &'static str,
    /// Reduction scale in meters per pixel.
    pub pixel_scale: f64,
    pub ndvi: BandPair,
    pub nbr: BandPair,
    pub cloud_mask: Option<CloudMask>,
    pub rescale: Option<Rescale>,
    pub ndvi_stretch: IndexStretch,
    pub nbr_stretch: IndexStretch,
}

impl SatelliteProfile {
    pub fn bands(&self, index: SpectralIndex) -> BandPair {
        match index {
            SpectralIndex::Ndvi => self.ndvi,
            SpectralIndex::Nbr => self.nbr,
        }
    }

    pub fn stretch(&self, index: SpectralIndex) -> IndexStretch {
        match index {
            SpectralIndex::Ndvi => self.ndvi_stretch,
            SpectralIndex::Nbr => self.nbr_stretch,
        }
    }
}

const LANDSAT_QA: CloudMask = CloudMask::QaBits {
    band: "QA_PIXEL",
    bits: &[3, 4],
};

const LANDSAT_L2_SCALE: Rescale = Rescale::Linear {
    gain: 0.000_027_5,
    offset: -0.2,
};

const NDVI_STRETCH: IndexStretch = IndexStretch {
    min: 0.0,
    max: 0.8,
    palette: &["brown", "yellow", "green", "darkgreen"],
};

const MODIS_NDVI_STRETCH: IndexStretch = IndexStretch {
    min: -0.2,
    max: 0.8,
    palette: &["red", "orange", "yellow", "green", "darkgreen"],
};

const NBR_STRETCH: IndexStretch = IndexStretch {
    min: -1.0,
    max: 1.0,
    palette: &["red", "orange", "yellow", "green", "blue"],
};

pub static CATALOG: &[SatelliteProfile] = &[
    SatelliteProfile {
        key: "Sentinel2",
        collection_id: "COPERNICUS/S2_SR_HARMONIZED",
        pixel_scale: 20.0,
        ndvi: BandPair { numerator: "B8", denominator: "B4" },
        nbr: BandPair { numerator: "B8", denominator: "B12" },
        cloud_mask: Some(CloudMask::QaBits { band: "QA60", bits: &[10, 11] }),
        rescale: Some(Rescale::Linear { gain: 0.0001, offset: 0.0 }),
        ndvi_stretch: NDVI_STRETCH,
        nbr_stretch: NBR_STRETCH,
    },
    SatelliteProfile {
        key: "Landsat5",
        collection_id: "LANDSAT/LT05/C02/T1_L2",
        pixel_scale: 30.0,
        ndvi: BandPair { numerator: "SR_B4", denominator: "SR_B3" },
        nbr: BandPair { numerator: "SR_B4", denominator: "SR_B7" },
        cloud_mask: Some(LANDSAT_QA),
        rescale: Some(LANDSAT_L2_SCALE),
        ndvi_stretch: NDVI_STRETCH,
        nbr_stretch: NBR_STRETCH,
    },
    SatelliteProfile {
        key: "Landsat7",
        collection_id: "LANDSAT/LE07/C02/T1_L2",
        pixel_scale: 30.0,
        ndvi: BandPair { numerator: "SR_B4", denominator: "SR_B3" },
        nbr: BandPair { numerator: "SR_B4", denominator: "SR_B7" },
        cloud_mask: Some(LANDSAT_QA),
        rescale: Some(LANDSAT_L2_SCALE),
        ndvi_stretch: NDVI_STRETCH,
        nbr_stretch: NBR_STRETCH,
    },
    SatelliteProfile {
        key: "Landsat8",
        collection_id: "LANDSAT/LC08/C02/T1_L2",
        pixel_scale: 30.0,
        ndvi: BandPair { numerator: "SR_B5", denominator: "SR_B4" },
        nbr: BandPair { numerator: "SR_B5", denominator: "SR_B7" },
        cloud_mask: Some(LANDSAT_QA),
        rescale: Some(LANDSAT_L2_SCALE),
        ndvi_stretch: NDVI_STRETCH,
        nbr_stretch: NBR_STRETCH,
    },
    SatelliteProfile {
        key: "Landsat9",
        collection_id: "LANDSAT/LC09/C02/T1_TOA",
        pixel_scale: 30.0,
        ndvi: BandPair { numerator: "B5", denominator: "B4" },
        nbr: BandPair { numerator: "B5", denominator: "B7" },
        cloud_mask: Some(LANDSAT_QA),
        rescale: None,
        ndvi_stretch: NDVI_STRETCH,
        nbr_stretch: NBR_STRETCH,
    },
    SatelliteProfile {
        key: "HLS",
        collection_id: "NASA/HLS/HLSL30/v002",
        pixel_scale: 30.0,
        ndvi: BandPair { numerator: "B5", denominator: "B4" },
        nbr: BandPair { numerator: "B5", denominator: "B7" },
        cloud_mask: Some(CloudMask::QaBits { band: "Fmask", bits: &[1, 2, 3] }),
        rescale: None,
        ndvi_stretch: NDVI_STRETCH,
        nbr_stretch: NBR_STRETCH,
    },
    SatelliteProfile {
        key: "MODIS",
        collection_id: "MODIS/061/MOD09A1",
        pixel_scale: 500.0,
        ndvi: BandPair { numerator: "sur_refl_b02", denominator: "sur_refl_b01" },
        nbr: BandPair { numerator: "sur_refl_b02", denominator: "sur_refl_b07" },
        cloud_mask: None,
        rescale: Some(Rescale::Linear { gain: 0.0001, offset: 0.0 }),
        ndvi_stretch: MODIS_NDVI_STRETCH,
        nbr_stretch: NBR_STRETCH,
    },
];

/// UI-facing labels and the catalog key each one resolves to.
pub static LABELS: &[(&str, &str)] = &[
    ("Landsat-9/OLI", "Landsat9"),
    ("Landsat-8/OLI", "Landsat8"),
    ("Landsat-7/ETM", "Landsat7"),
    ("Landsat-5/TM", "Landsat5"),
    ("Sentinel-2/MSI", "Sentinel2"),
    ("Terra/MODIS", "MODIS"),
    ("HLS (Harmon. Landsat / Sentinel)", "HLS"),
];

/// Map a UI label to its catalog key. Unknown labels pass through.
pub fn normalize_label(label: &str) -> &str {
    let label = label.trim();
    LABELS
        .iter()
        .find(|(ui, _)| *ui == label)
        .map(|(_, key)| *key)
        .unwrap_or(label)
}

/// Resolve a UI label or catalog key to its profile.
pub fn lookup(label: &str) -> Option<&'static SatelliteProfile> {
    let key = normalize_label(label);
    CATALOG.iter().find(|p| p.key == key)
}

/// UI label for a catalog key, if one exists.
pub fn label_for(key: &str) -> Option<&'static str> {
    LABELS.iter().find(|(_, k)| *k == key).map(|(ui, _)| *ui)
}

/// Check catalog consistency. Called at startup.
pub fn validate_catalog() -> Result<()> {
    for (i, profile) in CATALOG.iter().enumerate() {
        if CATALOG[..i].iter().any(|p| p.key == profile.key) {
            bail!("duplicate satellite key: {}", profile.key);
        }
        if profile.collection_id.is_empty() {
            bail!("{}: empty collection id", profile.key);
        }
        if !(profile.pixel_scale.is_finite() && profile.pixel_scale > 0.0) {
            bail!("{}: pixel scale must be positive", profile.key);
        }
        for index in SpectralIndex::ALL {
            let pair = profile.bands(index);
            if pair.numerator.is_empty() || pair.denominator.is_empty() {
                bail!("{}: empty band name for {}", profile.key, index);
            }
            if pair.numerator == pair.denominator {
                bail!("{}: {} uses the same band twice", profile.key, index);
            }
        }
        for index in SpectralIndex::ALL {
            let stretch = profile.stretch(index);
            if !(stretch.min.is_finite() && stretch.max.is_finite() && stretch.min < stretch.max) {
                bail!("{}: empty display range for {}", profile.key, index);
            }
            if stretch.palette.len() < 2 {
                bail!("{}: {} palette needs at least two colors", profile.key, index);
            }
        }
        if let Some(CloudMask::QaBits { band, bits }) = profile.cloud_mask {
            if band.is_empty() || bits.is_empty() || bits.iter().any(|b| *b > 31) {
                bail!("{}: invalid cloud mask", profile.key);
            }
        }
        if let Some(Rescale::Linear { gain, offset }) = profile.rescale {
            if !(gain.is_finite() && gain != 0.0 && offset.is_finite()) {
                bail!("{}: invalid reflectance rescale", profile.key);
            }
        }
    }
    for (label, key) in LABELS {
        if !CATALOG.iter().any(|p| p.key == *key) {
            bail!("label {} maps to unknown satellite {}", label, key);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_valid() {
        validate_catalog().unwrap();
    }

    #[test]
    fn test_every_label_resolves_with_both_indices() {
        for (label, key) in LABELS {
            let profile = lookup(label).unwrap_or_else(|| panic!("no profile for {}", label));
            assert_eq!(profile.key, *key);
            for index in SpectralIndex::ALL {
                let pair = profile.bands(index);
                assert!(!pair.numerator.is_empty() && !pair.denominator.is_empty());
            }
        }
    }

    #[test]
    fn test_keys_resolve_directly() {
        assert_eq!(lookup("Landsat8").unwrap().collection_id, "LANDSAT/LC08/C02/T1_L2");
        assert_eq!(lookup(" Sentinel-2/MSI ").unwrap().pixel_scale, 20.0);
    }

    #[test]
    fn test_unknown_label_passes_through_and_fails() {
        assert_eq!(normalize_label("SPOT-6"), "SPOT-6");
        assert!(lookup("SPOT-6").is_none());
    }

    #[test]
    fn test_index_parsing() {
        assert_eq!("nbr".parse::<SpectralIndex>().unwrap(), SpectralIndex::Nbr);
        assert_eq!("NDVI".parse::<SpectralIndex>().unwrap(), SpectralIndex::Ndvi);
        assert!("EVI".parse::<SpectralIndex>().is_err());
    }

    #[test]
    fn test_stretch_by_sensor() {
        let modis = lookup("Terra/MODIS").unwrap().stretch(SpectralIndex::Ndvi);
        assert_eq!((modis.min, modis.max), (-0.2, 0.8));
        assert_eq!(modis.palette.len(), 5);
        for profile in CATALOG.iter().filter(|p| p.key != "MODIS") {
            assert_eq!(profile.stretch(SpectralIndex::Ndvi), NDVI_STRETCH);
        }
        assert!(CATALOG.iter().all(|p| p.stretch(SpectralIndex::Nbr) == NBR_STRETCH));
    }

    #[test]
    fn test_label_for_key() {
        assert_eq!(label_for("MODIS"), Some("Terra/MODIS"));
        assert_eq!(label_for("nope"), None);
    }
}
