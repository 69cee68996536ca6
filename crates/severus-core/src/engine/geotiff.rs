//! Single-band float32 GeoTIFF (WGS84, uncompressed) for in-memory exports.

use std::io::Cursor;
use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;
use tiff::TiffResult;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;

/// Version 1.1.0 with three keys: geographic model, pixel-is-area, EPSG:4326.
const WGS84_GEOKEYS: [u16; 16] = [
    1, 1, 0, 3, //
    1024, 0, 1, 2, //
    1025, 0, 1, 1, //
    2048, 0, 1, 4326,
];

/// Georeferencing of the top-left pixel corner and the square pixel size,
/// all in degrees.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GeoReference {
    pub origin_lon: f64,
    pub origin_lat: f64,
    pub pixel_deg: f64,
}

pub(crate) fn write_geotiff(width: u32, height: u32, data: &[f32], geo: GeoReference) -> TiffResult<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut encoder = TiffEncoder::new(Cursor::new(&mut buf))?;
        let mut image = encoder.new_image::<Gray32Float>(width, height)?;

        let scale = [geo.pixel_deg, geo.pixel_deg, 0.0];
        image
            .encoder()
            .write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &scale[..])?;
        let tiepoint = [0.0, 0.0, 0.0, geo.origin_lon, geo.origin_lat, 0.0];
        image
            .encoder()
            .write_tag(Tag::Unknown(MODEL_TIEPOINT), &tiepoint[..])?;
        image
            .encoder()
            .write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), &WGS84_GEOKEYS[..])?;

        image.write_data(data)?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiff::decoder::{Decoder, DecodingResult};

    #[test]
    fn test_pixels_and_georeference_roundtrip() {
        let geo = GeoReference {
            origin_lon: -8.0,
            origin_lat: 40.0,
            pixel_deg: 0.001,
        };
        let bytes = write_geotiff(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.5], geo).unwrap();
        assert_eq!(&bytes[..4], b"II*\0");

        let mut decoder = Decoder::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (2, 3));
        assert_eq!(
            decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE)).unwrap(),
            vec![0.001, 0.001, 0.0]
        );
        let tiepoint = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT)).unwrap();
        assert_eq!(tiepoint[3], -8.0);
        assert_eq!(tiepoint[4], 40.0);
        assert_eq!(
            decoder.get_tag_u16_vec(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY)).unwrap()[15],
            4326
        );
        match decoder.read_image().unwrap() {
            DecodingResult::F32(pixels) => assert_eq!(pixels, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.5]),
            _ => panic!("expected float32 pixels"),
        }
    }

    #[test]
    fn test_short_buffer_is_an_error() {
        let geo = GeoReference {
            origin_lon: 0.0,
            origin_lat: 0.0,
            pixel_deg: 1.0,
        };
        assert!(write_geotiff(4, 4, &[0.0; 3], geo).is_err());
    }
}
