//! Plain-text rendering of the local ledger.

use std::fmt::Write;
use std::time::Duration;

use escrow_types::{EscrowId, EscrowRecord, Party};

const HEADER: &str = "=== Escrows ===";
const EMPTY_MARKER: &str = "(no escrows)";

#[must_use]
pub fn render(records: &[(EscrowId, EscrowRecord)]) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    if records.is_empty() {
        out.push_str(EMPTY_MARKER);
        out.push('\n');
        return out;
    }

    for (id, record) in records {
        let terms = record.terms();
        let _ = writeln!(out, "\n{id}  [{}]", record.state());
        let _ = writeln!(out, "  buyer:    {}", party(&terms.buyer));
        let _ = writeln!(out, "  seller:   {}", party(&terms.seller));
        let _ = writeln!(out, "  receiver: {}", party(&terms.receiver));
        let _ = writeln!(out, "  market:   {}", party(&terms.market));
        let _ = writeln!(out, "  amount:   {} wei", terms.amount);
        let _ = writeln!(out, "  fee:      {}", terms.fee_percent);
        let _ = writeln!(out, "  timeout:  {}", timeout(terms.timeout_period));
        let _ = writeln!(
            out,
            "  created:  {}",
            record.created_at().format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Some(position) = record.last_applied() {
            let _ = writeln!(out, "  as of:    block {position}");
        }
    }
    out
}

fn party(party: &Party) -> String {
    format!("{} ({})", party.name, party.address)
}

fn timeout(period: Duration) -> String {
    let secs = period.as_secs();
    if secs > 0 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else {
        format!("{secs}s")
    }
}
