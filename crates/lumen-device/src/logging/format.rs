/// Formats a byte count with a binary unit suffix ("512 B", "1.50 MiB").
pub fn human_size(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Formats an integer with thousands separators ("1,048,576").
pub fn human_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_below_a_kibibyte_are_plain_bytes() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
    }

    #[test]
    fn sizes_scale_through_units() {
        assert_eq!(human_size(1024), "1.00 KiB");
        assert_eq!(human_size(3 * 1024 * 1024 / 2), "1.50 MiB");
        assert_eq!(human_size(2 * 1024 * 1024 * 1024), "2.00 GiB");
    }

    #[test]
    fn numbers_get_thousands_separators() {
        assert_eq!(human_number(7), "7");
        assert_eq!(human_number(1000), "1,000");
        assert_eq!(human_number(1_048_576), "1,048,576");
    }
}
