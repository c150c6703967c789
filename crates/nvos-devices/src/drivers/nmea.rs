//! Minimal NMEA-0183 reader.
//!
//! Understands GGA, RMC, GSA, VTG and GSV from any talker and folds them into
//! a [`NavState`]. Sentences with a wrong checksum are dropped.

/// Longest sentence kept while waiting for a line terminator.
const MAX_SENTENCE_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingStart,

    #[error("checksum mismatch: expected {expected:02X}, computed {computed:02X}")]
    Checksum { expected: u8, computed: u8 },

    #[error("malformed {sentence} field {field}")]
    Field {
        sentence: &'static str,
        field: usize,
    },
}

/// Navigation data accumulated from the sentence stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavState {
    /// GGA fix quality; 0 means no fix.
    pub gga_quality: Option<u8>,
    /// RMC status `A` (active) or `V` (void).
    pub rmc_active: Option<bool>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Meters above mean sea level
    pub altitude: Option<f32>,
    pub speed_knots: Option<f32>,
    /// Degrees true
    pub course: Option<f32>,
    pub satellites_used: Option<u32>,
    pub satellites_in_view: Option<u32>,
    pub hdop: Option<f32>,
    pub vdop: Option<f32>,
    pub pdop: Option<f32>,
}

impl NavState {
    pub fn has_fix(&self) -> bool {
        self.gga_quality.map(|q| q > 0).unwrap_or(false) || self.rmc_active.unwrap_or(false)
    }

    pub fn satellite_count(&self) -> u32 {
        self.satellites_used
            .or(self.satellites_in_view)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga {
        quality: u8,
        latitude: Option<f64>,
        longitude: Option<f64>,
        satellites: Option<u32>,
        hdop: Option<f32>,
        altitude: Option<f32>,
    },
    Rmc {
        active: bool,
        latitude: Option<f64>,
        longitude: Option<f64>,
        speed_knots: Option<f32>,
        course: Option<f32>,
    },
    Gsa {
        pdop: Option<f32>,
        hdop: Option<f32>,
        vdop: Option<f32>,
    },
    Vtg {
        course: Option<f32>,
        speed_knots: Option<f32>,
    },
    Gsv {
        in_view: Option<u32>,
    },
    /// Valid but not interpreted.
    Other,
}

/// Parse one sentence, with or without trailing line terminator.
pub fn parse_sentence(line: &str) -> Result<Sentence, NmeaError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let body = line.strip_prefix('$').ok_or(NmeaError::MissingStart)?;

    let body = match body.rsplit_once('*') {
        Some((payload, checksum)) => {
            let expected = u8::from_str_radix(checksum.trim(), 16).map_err(|_| NmeaError::Field {
                sentence: "checksum",
                field: 0,
            })?;
            let computed = payload.bytes().fold(0u8, |acc, b| acc ^ b);
            if expected != computed {
                return Err(NmeaError::Checksum { expected, computed });
            }
            payload
        }
        None => body,
    };

    let fields: Vec<&str> = body.split(',').collect();
    let kind = fields[0].get(2..).unwrap_or_default();
    let field = |i: usize| fields.get(i).copied().unwrap_or("");

    match kind {
        "GGA" => Ok(Sentence::Gga {
            quality: number::<u8>(field(6), "GGA", 6)?.unwrap_or(0),
            latitude: coordinate(field(2), field(3), "GGA", 2)?,
            longitude: coordinate(field(4), field(5), "GGA", 4)?,
            satellites: number(field(7), "GGA", 7)?,
            hdop: number(field(8), "GGA", 8)?,
            altitude: number(field(9), "GGA", 9)?,
        }),
        "RMC" => Ok(Sentence::Rmc {
            active: field(2) == "A",
            latitude: coordinate(field(3), field(4), "RMC", 3)?,
            longitude: coordinate(field(5), field(6), "RMC", 5)?,
            speed_knots: number(field(7), "RMC", 7)?,
            course: number(field(8), "RMC", 8)?,
        }),
        "GSA" => Ok(Sentence::Gsa {
            pdop: number(field(15), "GSA", 15)?,
            hdop: number(field(16), "GSA", 16)?,
            vdop: number(field(17), "GSA", 17)?,
        }),
        "VTG" => Ok(Sentence::Vtg {
            course: number(field(1), "VTG", 1)?,
            speed_knots: number(field(5), "VTG", 5)?,
        }),
        "GSV" => Ok(Sentence::Gsv {
            in_view: number(field(3), "GSV", 3)?,
        }),
        _ => Ok(Sentence::Other),
    }
}

fn number<T: std::str::FromStr>(
    text: &str,
    sentence: &'static str,
    field: usize,
) -> Result<Option<T>, NmeaError> {
    if text.is_empty() {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|_| NmeaError::Field { sentence, field })
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere into signed decimal degrees.
fn coordinate(
    value: &str,
    hemisphere: &str,
    sentence: &'static str,
    field: usize,
) -> Result<Option<f64>, NmeaError> {
    let Some(raw) = number::<f64>(value, sentence, field)? else {
        return Ok(None);
    };
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        _ => Err(NmeaError::Field {
            sentence,
            field: field + 1,
        }),
    }
}

/// Splits a byte stream into sentences and applies them.
#[derive(Debug, Default)]
pub struct NmeaReader {
    buffer: Vec<u8>,
    state: NavState,
    rejected: u64,
}

impl NmeaReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &NavState {
        &self.state
    }

    /// Sentences dropped because they failed to parse.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Feed raw bytes. Returns the number of sentences applied.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let mut applied = 0;
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.buffer);
                if self.apply_line(&line) {
                    applied += 1;
                }
            } else if byte == b'$' {
                // A start marker always begins a new sentence.
                self.buffer.clear();
                self.buffer.push(byte);
            } else if !self.buffer.is_empty() && self.buffer.len() < MAX_SENTENCE_LEN {
                self.buffer.push(byte);
            }
        }
        applied
    }

    fn apply_line(&mut self, line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            self.rejected += 1;
            return false;
        };
        if text.trim().is_empty() {
            return false;
        }

        match parse_sentence(text) {
            Ok(sentence) => {
                self.apply(sentence);
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, sentence = text.trim(), "dropping NMEA sentence");
                self.rejected += 1;
                false
            }
        }
    }

    fn apply(&mut self, sentence: Sentence) {
        let state = &mut self.state;
        match sentence {
            Sentence::Gga {
                quality,
                latitude,
                longitude,
                satellites,
                hdop,
                altitude,
            } => {
                state.gga_quality = Some(quality);
                state.satellites_used = satellites.or(state.satellites_used);
                state.hdop = hdop.or(state.hdop);
                if quality > 0 {
                    state.latitude = latitude.or(state.latitude);
                    state.longitude = longitude.or(state.longitude);
                    state.altitude = altitude.or(state.altitude);
                }
            }
            Sentence::Rmc {
                active,
                latitude,
                longitude,
                speed_knots,
                course,
            } => {
                state.rmc_active = Some(active);
                if active {
                    state.latitude = latitude.or(state.latitude);
                    state.longitude = longitude.or(state.longitude);
                    state.speed_knots = speed_knots.or(state.speed_knots);
                    state.course = course.or(state.course);
                }
            }
            Sentence::Gsa { pdop, hdop, vdop } => {
                state.pdop = pdop.or(state.pdop);
                state.hdop = hdop.or(state.hdop);
                state.vdop = vdop.or(state.vdop);
            }
            Sentence::Vtg {
                course,
                speed_knots,
            } => {
                state.course = course.or(state.course);
                state.speed_knots = speed_knots.or(state.speed_knots);
            }
            Sentence::Gsv { in_view } => {
                state.satellites_in_view = in_view.or(state.satellites_in_view);
            }
            Sentence::Other => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA_FIX: &str =
        "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC_FIX: &str =
        "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    #[test]
    fn test_parse_gga() {
        match parse_sentence(GGA_FIX).unwrap() {
            Sentence::Gga {
                quality,
                latitude,
                longitude,
                satellites,
                hdop,
                altitude,
            } => {
                assert_eq!(quality, 1);
                assert!((latitude.unwrap() - 48.1173).abs() < 1e-4);
                assert!((longitude.unwrap() - 11.516_666).abs() < 1e-4);
                assert_eq!(satellites, Some(8));
                assert_eq!(hdop, Some(0.9));
                assert_eq!(altitude, Some(545.4));
            }
            other => panic!("unexpected sentence {:?}", other),
        }
    }

    #[test]
    fn test_parse_rmc_southern_western_hemisphere() {
        let sentence = "$GNRMC,000000,A,3351.000,S,15112.000,W,1.5,270.0,010120,,";
        match parse_sentence(sentence).unwrap() {
            Sentence::Rmc {
                active,
                latitude,
                longitude,
                course,
                ..
            } => {
                assert!(active);
                assert!((latitude.unwrap() + 33.85).abs() < 1e-6);
                assert!((longitude.unwrap() + 151.2).abs() < 1e-6);
                assert_eq!(course, Some(270.0));
            }
            other => panic!("unexpected sentence {:?}", other),
        }
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let corrupted = GGA_FIX.replace("*47", "*48");
        assert!(matches!(
            parse_sentence(&corrupted),
            Err(NmeaError::Checksum { expected: 0x48, .. })
        ));
    }

    #[test]
    fn test_reader_handles_split_chunks() {
        let mut reader = NmeaReader::new();
        let stream = format!("{}\r\n{}\r\n", GGA_FIX, RMC_FIX);
        let (a, b) = stream.as_bytes().split_at(30);

        assert_eq!(reader.feed(a), 0);
        assert_eq!(reader.feed(b), 2);

        let state = reader.state();
        assert!(state.has_fix());
        assert_eq!(state.satellite_count(), 8);
        assert_eq!(state.speed_knots, Some(22.4));
        assert_eq!(state.course, Some(84.4));
    }

    #[test]
    fn test_no_fix_keeps_position_unknown() {
        let mut reader = NmeaReader::new();
        reader.feed(b"$GPGGA,,,,,,0,00,,,M,,M,,\r\n$GPGSV,1,1,03,01,,,,02,,,,03,,,\r\n");

        let state = reader.state();
        assert!(!state.has_fix());
        assert_eq!(state.latitude, None);
        assert_eq!(state.satellites_used, Some(0));
        assert_eq!(state.satellites_in_view, Some(3));
    }

    #[test]
    fn test_garbage_is_counted_not_applied() {
        let mut reader = NmeaReader::new();
        reader.feed(b"noise$GPGGA,1,2,X*00\r\n");
        assert_eq!(reader.rejected(), 1);
        assert_eq!(reader.state(), &NavState::default());
    }
}
