//! Rough storage/bandwidth estimate for continuous recording.

/// Multiplier applied to MB totals (1 MiB = 1.048576 MB)
const MIB_CONV: f64 = 1.048576;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageEstimate {
    pub fps: u32,
    pub daily_mib: f64,
    pub weekly_mib: f64,
    pub monthly_mib: f64,
}

/// Uncompressed RGB usage for `intervals` live blocks of `interval_minutes` per day
pub fn estimate(width: u32, height: u32, fps: u32, intervals: u32, interval_minutes: f64) -> UsageEstimate {
    let live_minutes_per_day = f64::from(intervals) * interval_minutes;
    let frames_per_day = f64::from(fps) * live_minutes_per_day * 60.0;

    let pixels_per_frame = f64::from(width) * f64::from(height);
    let megabytes_per_frame = pixels_per_frame * 3.0 / 1_000_000.0;

    let daily_mib = MIB_CONV * megabytes_per_frame * frames_per_day;
    let weekly_mib = daily_mib * 7.0;

    UsageEstimate {
        fps,
        daily_mib,
        weekly_mib,
        monthly_mib: weekly_mib * 4.0,
    }
}

/// Two decimals with comma-grouped thousands, e.g. `1,234,567.89`
fn grouped(value: f64) -> String {
    let fixed = format!("{:.2}", value);
    let (int, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let (sign, digits) = match int.strip_prefix('-') {
        Some(digits) => ("-", digits),
        None => ("", int),
    };

    let mut out = String::with_capacity(fixed.len() + digits.len() / 3);
    out.push_str(sign);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out.push('.');
    out.push_str(frac);
    out
}

impl std::fmt::Display for UsageEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} fps Daily Estimate: {} MiB", self.fps, grouped(self.daily_mib))?;
        writeln!(f, "{} fps Weekly Estimate: {} MiB", self.fps, grouped(self.weekly_mib))?;
        writeln!(f, "{} fps Monthly Estimate: {} MiB", self.fps, grouped(self.monthly_mib))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_linearly() {
        let one = estimate(704, 576, 10, 1, 10.0);
        let two = estimate(704, 576, 10, 2, 10.0);
        assert!((two.daily_mib - 2.0 * one.daily_mib).abs() < 1e-6);
        assert!((one.weekly_mib - 7.0 * one.daily_mib).abs() < 1e-6);
        assert!((one.monthly_mib - 28.0 * one.daily_mib).abs() < 1e-6);
    }

    #[test]
    fn groups_thousands() {
        assert_eq!(grouped(0.0), "0.00");
        assert_eq!(grouped(999.999), "1,000.00");
        assert_eq!(grouped(1234567.891), "1,234,567.89");
        assert_eq!(grouped(-12345.5), "-12,345.50");
    }

    #[test]
    fn display_matches_report_layout() {
        let e = estimate(1000, 1000, 1, 10, 100.0);
        // 3 MB * 60000 frames * 1.048576
        assert_eq!(
            e.to_string(),
            "1 fps Daily Estimate: 188,743.68 MiB\n\
             1 fps Weekly Estimate: 1,321,205.76 MiB\n\
             1 fps Monthly Estimate: 5,284,823.04 MiB\n"
        );
    }

    #[test]
    fn known_value() {
        // 1000x1000 rgb = 3 MB/frame, 1 fps for one minute = 60 frames
        let e = estimate(1000, 1000, 1, 1, 1.0);
        assert!((e.daily_mib - 180.0 * 1.048576).abs() < 1e-9);
    }
}
