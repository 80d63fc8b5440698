use std::time::Duration;

/// Megabits (2^20 bits) per second for `bytes` moved in `elapsed`.
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes * 8) as f64 / (1024.0 * 1024.0) / secs
}

pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        return format!("{} ms", d.as_millis());
    }

    let secs = d.as_secs_f64();
    if secs < 60.0 {
        return format!("{:.1} sec", secs);
    }

    let minutes = (secs / 60.0) as u64;
    let remaining = secs - (minutes * 60) as f64;
    format!("{}m {:.1}s", minutes, remaining)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    let prefix = b"KMGTPE"[exp] as char;
    format!("{:.1} {}B", bytes as f64 / div as f64, prefix)
}

/// `Duration` as integer nanoseconds.
pub mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_nanos() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}

/// `Vec<Duration>` as a list of integer nanoseconds.
pub mod duration_nanos_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        let nanos: Vec<u64> = v.iter().map(|d| d.as_nanos() as u64).collect();
        nanos.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        let nanos = Vec::<u64>::deserialize(d)?;
        Ok(nanos.into_iter().map(Duration::from_nanos).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250 ms");
        assert_eq!(format_duration(Duration::from_millis(3400)), "3.4 sec");
        assert_eq!(format_duration(Duration::from_secs(95)), "1m 35.0s");
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MB");
    }

    #[test]
    fn mbps_of_one_mebibyte_per_second() {
        assert_eq!(mbps(1024 * 1024, Duration::from_secs(1)), 8.0);
        assert_eq!(mbps(1024, Duration::ZERO), 0.0);
    }
}
