//! Human-readable sizes and ages for terminal output

use chrono::{DateTime, Utc};
use chrono_humanize::HumanTime;
use humansize::{DECIMAL, format_size};

use attachments::Attachment;

/// Decimal size, e.g. "29 B" or "1.40 MB"
pub fn natural_size(bytes: u64) -> String {
    format_size(bytes, DECIMAL)
}

/// Relative age, e.g. "5 minutes ago"
pub fn natural_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    HumanTime::from(then - now).to_string()
}

/// One line per attachment: id, name, cache age, sizes and codec
pub fn attachment_line(attachment: &Attachment, now: DateTime<Utc>) -> String {
    let age = match attachment.cached_at {
        Some(cached_at) => natural_time(cached_at, now),
        None => "(not cached)".to_string(),
    };

    let compressed = attachment
        .compressed_size()
        .map(natural_size)
        .unwrap_or_else(|| "??".to_string());
    let sizes = match (attachment.size(), attachment.compression_ratio()) {
        (Some(size), Some(ratio)) => {
            format!("{} -> {} {:.1}%", natural_size(size), compressed, ratio * 100.0)
        }
        _ => format!("??? -> {compressed}"),
    };

    let codec = attachment
        .compression()
        .map(|c| c.name())
        .unwrap_or("-");

    format!(
        "{} {:20} {} {} {}",
        attachment.id.simple(),
        attachment.filename,
        age,
        sizes,
        codec
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use attachments::{Compression, DigestAlgorithm};

    #[test]
    fn test_natural_size() {
        assert_eq!(natural_size(29), format_size(29u64, DECIMAL));
        assert!(natural_size(29).starts_with("29"));
        assert!(natural_size(1_500).ends_with("kB"));
        assert!(natural_size(1_073_741_824).ends_with("GB"));
    }

    #[test]
    fn test_natural_time() {
        let now = Utc::now();
        assert_eq!(natural_time(now, now), "now");
        let hours = natural_time(now - chrono::Duration::hours(5), now);
        assert!(hours.contains("hours") && hours.ends_with("ago"), "{hours}");
        let days = natural_time(now - chrono::Duration::days(3), now);
        assert!(days.contains("days") && days.ends_with("ago"), "{days}");
    }

    #[test]
    fn test_attachment_line() {
        let mut attachment = Attachment::new("hello.txt", None);
        attachment
            .data(b"Hello from the test framework", Compression::None, DigestAlgorithm::Sha256)
            .unwrap();

        let line = attachment_line(&attachment, Utc::now());
        assert!(line.starts_with(&attachment.id.simple()));
        assert!(line.contains("hello.txt"));
        assert!(line.contains("(not cached)"));
        let size = natural_size(29);
        assert!(line.contains(&format!("{size} -> {size} 100.0%")));
        assert!(line.ends_with("none"));
    }
}
