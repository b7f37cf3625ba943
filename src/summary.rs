use std::fmt::Write as _;

use crate::{notify::escape_html, observation::UsageReport};

const ENTRIES_PER_MESSAGE: usize = 100;

/// Render the per-cycle active-IP summary as one or more HTML messages.
///
/// Users are listed in report order and followed by the total line. Each
/// message holds at most 100 of those entries.
pub(crate) fn active_ip_messages(reports: &[UsageReport]) -> Vec<String> {
    let mut entries = reports
        .iter()
        .map(|report| {
            let mut entry = format!(
                "<code>{}</code> with <code>{}</code> active ip  ",
                escape_html(&report.name),
                report.ips.len()
            );
            for ip in &report.ips {
                let _ = write!(entry, "\n- {}", escape_html(ip));
            }
            entry
        })
        .collect::<Vec<_>>();

    let total = reports.iter().map(|report| report.ips.len()).sum::<usize>();
    entries.push(format!("---------\nCount Of All Active IPs: <b>{total}</b>"));

    entries
        .chunks(ENTRIES_PER_MESSAGE)
        .map(|chunk| chunk.join("\n"))
        .collect()
}
