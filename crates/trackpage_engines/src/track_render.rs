#![forbid(unsafe_code)]

use std::env;
use std::io::Write;

use chrono::NaiveDateTime;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use trackpage_contracts::activity::{display_label_for, ARTIFACT_EXTENSION};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
const INK: u8 = 0;
const PAPER: u8 = 255;

#[derive(Debug, Clone, PartialEq)]
pub enum RenderError {
    Parse(String),
    InvalidCoordinate { lat: f64, lon: f64 },
    EmptyTrack,
    Encode(String),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "gpx parse failed: {msg}"),
            Self::InvalidCoordinate { lat, lon } => {
                write!(f, "track point out of range: lat={lat} lon={lon}")
            }
            Self::EmptyTrack => write!(f, "gpx contains no track points"),
            Self::Encode(msg) => write!(f, "png encode failed: {msg}"),
        }
    }
}

impl std::error::Error for RenderError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTrack {
    pub bytes: Vec<u8>,
    pub display_label: String,
}

/// Pure transform from a raw track to artifact bytes. Writing the bytes is the
/// caller's job, so a render can never leave a partial file behind.
pub trait TrackRenderer {
    /// File extension of the produced artifact, without the dot.
    fn extension(&self) -> &'static str;

    fn render(
        &self,
        raw_track: &[u8],
        start_time_local: NaiveDateTime,
    ) -> Result<RenderedTrack, RenderError>;
}

impl<T: TrackRenderer + ?Sized> TrackRenderer for Box<T> {
    fn extension(&self) -> &'static str {
        (**self).extension()
    }

    fn render(
        &self,
        raw_track: &[u8],
        start_time_local: NaiveDateTime,
    ) -> Result<RenderedTrack, RenderError> {
        (**self).render(raw_track, start_time_local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderConfig {
    pub size_px: u32,
    pub line_width_px: u32,
    pub margin_px: u32,
}

impl RenderConfig {
    /// 6in square at 300dpi.
    pub fn mvp_v1() -> Self {
        Self {
            size_px: 1_800,
            line_width_px: 8,
            margin_px: 24,
        }
    }

    pub fn from_env() -> Self {
        let base = Self::mvp_v1();
        let size_px = env::var("TRACKPAGE_RENDER_SIZE_PX")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| (64..=8_192).contains(v))
            .unwrap_or(base.size_px);
        let line_width_px = env::var("TRACKPAGE_RENDER_LINE_PX")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| (1..=64).contains(v))
            .unwrap_or(base.line_width_px);
        Self {
            size_px,
            line_width_px,
            margin_px: (size_px / 75).max(line_width_px),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Draws every track segment as a black round-capped polyline on white, with equal
/// scale on both axes, and encodes the canvas as 8-bit grayscale PNG.
#[derive(Debug, Clone)]
pub struct GpxPngRenderer {
    config: RenderConfig,
}

impl GpxPngRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }
}

impl TrackRenderer for GpxPngRenderer {
    fn extension(&self) -> &'static str {
        ARTIFACT_EXTENSION
    }

    fn render(
        &self,
        raw_track: &[u8],
        start_time_local: NaiveDateTime,
    ) -> Result<RenderedTrack, RenderError> {
        let segments = parse_gpx_segments(raw_track)?;
        let canvas = rasterize(&segments, &self.config);
        let bytes = encode_grayscale_png(canvas.size, canvas.size, &canvas.pixels)?;
        Ok(RenderedTrack {
            bytes,
            display_label: display_label_for(start_time_local),
        })
    }
}

/// Track points grouped by `trkseg`. Points outside any segment form their own group.
pub fn parse_gpx_segments(raw: &[u8]) -> Result<Vec<Vec<TrackPoint>>, RenderError> {
    let mut reader = Reader::from_reader(raw);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut segments = Vec::new();
    let mut current: Vec<TrackPoint> = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            RenderError::Parse(format!("at byte {}: {e}", reader.buffer_position()))
        })?;
        match event {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"trkseg" => flush_segment(&mut segments, &mut current),
                b"trkpt" => current.push(parse_track_point(&e)?),
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"trkseg" => {
                flush_segment(&mut segments, &mut current)
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    flush_segment(&mut segments, &mut current);
    if segments.is_empty() {
        return Err(RenderError::EmptyTrack);
    }
    Ok(segments)
}

fn flush_segment(segments: &mut Vec<Vec<TrackPoint>>, current: &mut Vec<TrackPoint>) {
    if !current.is_empty() {
        segments.push(std::mem::take(current));
    }
}

fn parse_track_point(e: &BytesStart<'_>) -> Result<TrackPoint, RenderError> {
    let mut lat = None;
    let mut lon = None;
    for attr in e.attributes() {
        let attr = attr.map_err(|err| RenderError::Parse(err.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|err| RenderError::Parse(err.to_string()))?;
        match attr.key.local_name().as_ref() {
            b"lat" => lat = Some(parse_coordinate("lat", &value)?),
            b"lon" => lon = Some(parse_coordinate("lon", &value)?),
            _ => {}
        }
    }
    let (Some(lat), Some(lon)) = (lat, lon) else {
        return Err(RenderError::Parse("trkpt without lat/lon".to_string()));
    };
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(RenderError::InvalidCoordinate { lat, lon });
    }
    Ok(TrackPoint { lat, lon })
}

fn parse_coordinate(field: &str, raw: &str) -> Result<f64, RenderError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| RenderError::Parse(format!("{field}={raw:?} is not a number")))
}

struct Canvas {
    size: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    fn blank(size: u32) -> Self {
        Self {
            size,
            pixels: vec![PAPER; (size as usize) * (size as usize)],
        }
    }

    fn stamp_disc(&mut self, cx: f64, cy: f64, radius: f64) {
        let size = i64::from(self.size);
        let min_x = ((cx - radius).floor() as i64).max(0);
        let max_x = ((cx + radius).ceil() as i64).min(size - 1);
        let min_y = ((cy - radius).floor() as i64).max(0);
        let max_y = ((cy + radius).ceil() as i64).min(size - 1);
        let r2 = radius * radius;
        for py in min_y..=max_y {
            for px in min_x..=max_x {
                let dx = px as f64 + 0.5 - cx;
                let dy = py as f64 + 0.5 - cy;
                if dx * dx + dy * dy <= r2 {
                    self.pixels[(py * size + px) as usize] = INK;
                }
            }
        }
    }

    fn stroke(&mut self, from: (f64, f64), to: (f64, f64), radius: f64) {
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let steps = ((dx.abs().max(dy.abs())) * 2.0).ceil().max(1.0) as u64;
        for i in 0..=steps {
            let t = i as f64 / steps as f64;
            self.stamp_disc(from.0 + dx * t, from.1 + dy * t, radius);
        }
    }
}

fn rasterize(segments: &[Vec<TrackPoint>], config: &RenderConfig) -> Canvas {
    let mut canvas = Canvas::blank(config.size_px);
    let all = segments.iter().flatten();
    let count = segments.iter().map(Vec::len).sum::<usize>().max(1) as f64;
    let mean_lat = all.clone().map(|p| p.lat).sum::<f64>() / count;
    let x_scale = mean_lat.to_radians().cos().max(1e-6);

    let project = |p: &TrackPoint| (p.lon * x_scale, p.lat);
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for p in all {
        let (x, y) = project(p);
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_y = min_y.min(y);
        max_y = max_y.max(y);
    }

    let margin = f64::from(config.margin_px.min(config.size_px / 4));
    let available = f64::from(config.size_px) - 2.0 * margin;
    let span = (max_x - min_x).max(max_y - min_y).max(1e-9);
    let scale = available / span;
    let offset_x = margin + (available - (max_x - min_x) * scale) / 2.0;
    let offset_y = margin + (available - (max_y - min_y) * scale) / 2.0;
    let to_pixel = |p: &TrackPoint| {
        let (x, y) = project(p);
        (
            offset_x + (x - min_x) * scale,
            offset_y + (max_y - y) * scale,
        )
    };

    let radius = f64::from(config.line_width_px) / 2.0;
    for segment in segments {
        let mut previous: Option<(f64, f64)> = None;
        for point in segment {
            let current = to_pixel(point);
            match previous {
                Some(prev) => canvas.stroke(prev, current, radius),
                None => canvas.stamp_disc(current.0, current.1, radius),
            }
            previous = Some(current);
        }
    }
    canvas
}

pub fn encode_grayscale_png(width: u32, height: u32, pixels: &[u8]) -> Result<Vec<u8>, RenderError> {
    let row_len = width as usize;
    if row_len == 0 || pixels.len() != row_len * height as usize {
        return Err(RenderError::Encode(format!(
            "pixel buffer of {} bytes does not match {width}x{height}",
            pixels.len()
        )));
    }

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    // bit depth 8, grayscale, deflate, adaptive filtering, no interlace
    ihdr.extend_from_slice(&[8, 0, 0, 0, 0]);

    let mut scanlines = Vec::with_capacity((row_len + 1) * height as usize);
    for row in pixels.chunks(row_len) {
        scanlines.push(0);
        scanlines.extend_from_slice(row);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&scanlines)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    let idat = encoder
        .finish()
        .map_err(|e| RenderError::Encode(e.to_string()))?;

    let mut out = Vec::with_capacity(PNG_SIGNATURE.len() + idat.len() + 64);
    out.extend_from_slice(&PNG_SIGNATURE);
    write_chunk(&mut out, b"IHDR", &ihdr);
    write_chunk(&mut out, b"IDAT", &idat);
    write_chunk(&mut out, b"IEND", &[]);
    Ok(out)
}

fn write_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(data);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    const SAMPLE_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><name>Morning Run</name>
    <trkseg>
      <trkpt lat="47.6062" lon="-122.3321"><ele>10</ele><time>2024-01-01T16:00:00Z</time></trkpt>
      <trkpt lat="47.6070" lon="-122.3300"/>
      <trkpt lat="47.6085" lon="-122.3290"/>
    </trkseg>
    <trkseg>
      <trkpt lat="47.6090" lon="-122.3310"/>
    </trkseg>
  </trk>
</gpx>"#;

    fn start() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn small() -> GpxPngRenderer {
        GpxPngRenderer::new(RenderConfig {
            size_px: 64,
            line_width_px: 2,
            margin_px: 4,
        })
    }

    fn decode_pixels(png: &[u8]) -> (u32, Vec<u8>) {
        let width = u32::from_be_bytes(png[16..20].try_into().unwrap());
        let idat_len = u32::from_be_bytes(png[33..37].try_into().unwrap()) as usize;
        assert_eq!(&png[37..41], b"IDAT");
        let mut raw = Vec::new();
        ZlibDecoder::new(&png[41..41 + idat_len])
            .read_to_end(&mut raw)
            .unwrap();
        (width, raw)
    }

    #[test]
    fn at_render_01_segments_follow_trkseg_boundaries() {
        let segments = parse_gpx_segments(SAMPLE_GPX.as_bytes()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len(), 3);
        assert_eq!(segments[1][0].lat, 47.6090);
    }

    #[test]
    fn at_render_02_png_has_valid_header_and_ink() {
        let rendered = small().render(SAMPLE_GPX.as_bytes(), start()).unwrap();
        let png = &rendered.bytes;
        assert_eq!(&png[..8], &PNG_SIGNATURE);
        assert_eq!(&png[12..16], b"IHDR");
        let mut crc = crc32fast::Hasher::new();
        crc.update(&png[12..29]);
        assert_eq!(
            crc.finalize(),
            u32::from_be_bytes(png[29..33].try_into().unwrap())
        );
        assert_eq!(&png[png.len() - 8..png.len() - 4], b"IEND");

        let (width, raw) = decode_pixels(png);
        assert_eq!(width, 64);
        assert_eq!(raw.len(), 65 * 64);
        assert!(raw.iter().any(|b| *b == INK));
        // corners stay blank thanks to the margin
        assert_eq!(raw[1], PAPER);
        assert_eq!(rendered.display_label, "2024-01-01 @ 08:00");
    }

    #[test]
    fn at_render_03_render_is_deterministic() {
        let a = small().render(SAMPLE_GPX.as_bytes(), start()).unwrap();
        let b = small().render(SAMPLE_GPX.as_bytes(), start()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn at_render_04_single_point_track_still_renders() {
        let gpx = r#"<gpx><trk><trkseg><trkpt lat="1.0" lon="2.0"/></trkseg></trk></gpx>"#;
        let rendered = small().render(gpx.as_bytes(), start()).unwrap();
        let (_, raw) = decode_pixels(&rendered.bytes);
        assert!(raw.iter().any(|b| *b == INK));
    }

    #[test]
    fn at_render_05_bad_inputs_fail_with_typed_errors() {
        assert_eq!(
            parse_gpx_segments(b"<gpx><trk></trk></gpx>"),
            Err(RenderError::EmptyTrack)
        );
        assert!(matches!(
            parse_gpx_segments(br#"<gpx><trkpt lat="x" lon="1"/></gpx>"#),
            Err(RenderError::Parse(_))
        ));
        assert!(matches!(
            parse_gpx_segments(br#"<gpx><trkpt lat="91" lon="1"/></gpx>"#),
            Err(RenderError::InvalidCoordinate { .. })
        ));
        assert!(matches!(
            parse_gpx_segments(b"<gpx><trk></gpx>"),
            Err(RenderError::Parse(_))
        ));
    }
}
