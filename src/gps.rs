//! GNSS status reports (`+CGNSINF` / `+UGNSINF`)

use crate::at::split_fields;
use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

/// A position fix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub time: Option<NaiveDateTime>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)?;
        if let Some(alt) = self.altitude {
            write!(f, " ({:.1} m)", alt)?;
        }
        Ok(())
    }
}

/// Unsolicited GNSS status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsReport {
    pub running: bool,
    pub fix: bool,
    pub location: Option<Location>,
}

impl GpsReport {
    /// Parse the comma separated GNSS navigation fields
    ///
    /// `<run>,<fix>,<utc>,<lat>,<lon>,<alt>,...`
    pub fn parse(fields: &str) -> Result<Self> {
        let fields = split_fields(fields);
        if fields.len() < 2 {
            return Err(Error::Parse(format!("GNSS report too short: {:?}", fields)));
        }

        let running = fields[0] == "1";
        let fix = fields[1] == "1";
        let location = if fix { parse_location(&fields) } else { None };

        Ok(Self {
            running,
            fix,
            location,
        })
    }
}

fn parse_location(fields: &[String]) -> Option<Location> {
    let latitude = fields.get(3)?.parse().ok()?;
    let longitude = fields.get(4)?.parse().ok()?;
    let altitude = fields.get(5).and_then(|a| a.parse().ok());
    let time = fields
        .get(2)
        .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y%m%d%H%M%S%.3f").ok());

    Some(Location {
        latitude,
        longitude,
        altitude,
        time,
    })
}

/// Parse the lines of an `AT+CGNSINF` response into a location
pub fn parse_location_response(lines: &[String]) -> Result<Option<Location>> {
    let line = lines
        .iter()
        .find_map(|l| l.strip_prefix("+CGNSINF:"))
        .ok_or_else(|| Error::Parse("no +CGNSINF line in response".to_string()))?;

    Ok(GpsReport::parse(line)?.location)
}

/// Location text, or "no fix"
pub fn describe_location(location: Option<&Location>) -> String {
    match location {
        Some(loc) => loc.to_string(),
        None => "no fix".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    const FIX: &str = "1,1,20240501123005.000,52.370216,4.895168,12.300,0.00,0.0,1,,1.2,1.5,0.9,,9,6,,,38,,";

    #[test]
    fn test_parse_fix() {
        let report = GpsReport::parse(FIX).unwrap();
        assert!(report.running);
        assert!(report.fix);
        let loc = report.location.unwrap();
        assert_eq!(loc.latitude, 52.370216);
        assert_eq!(loc.longitude, 4.895168);
        assert_eq!(loc.altitude, Some(12.3));
        assert_eq!(loc.time.unwrap().second(), 5);
    }

    #[test]
    fn test_parse_no_fix() {
        let report = GpsReport::parse("1,0,,,,,,,,,,,,,,,,,,,").unwrap();
        assert!(report.running);
        assert!(!report.fix);
        assert!(report.location.is_none());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(GpsReport::parse("").is_err());
    }

    #[test]
    fn test_parse_location_response() {
        let lines = vec![format!("+CGNSINF: {}", FIX)];
        let loc = parse_location_response(&lines).unwrap().unwrap();
        assert_eq!(loc.to_string(), "52.370216, 4.895168 (12.3 m)");

        assert!(parse_location_response(&[]).is_err());
    }

    #[test]
    fn test_describe_location() {
        assert_eq!(describe_location(None), "no fix");
    }
}
