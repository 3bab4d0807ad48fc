use std::io::{self, Write};

use crate::engine::Snapshot;

/// Column header printed above the top-N rows.
pub const HEADER: &str = "PID      COMM             DIR    DEV        IOS      KBYTES  AVG_LAT_US    KB/s";

/// Write the `top` busiest buckets of `snapshot`, ranked by bytes.
///
/// Reads nothing but the snapshot. Prints nothing when there are no buckets.
pub fn render_top<W: Write>(out: &mut W, snapshot: &Snapshot, top: usize) -> io::Result<()> {
    if top == 0 || snapshot.is_empty() {
        return Ok(());
    }

    let elapsed_s = snapshot.elapsed_ns as f64 / 1e9;

    writeln!(out, "{HEADER}")?;
    for (key, io) in snapshot.top_by_bytes(top) {
        let kbytes = io.bytes / 1024;
        let avg_us = io.avg_latency_ns() as f64 / 1e3;
        let rate = if elapsed_s > 0.0 {
            io.bytes as f64 / 1024.0 / elapsed_s
        } else {
            0.0
        };
        writeln!(
            out,
            "{:<8} {:<16} {:<6} {:<10} {:>5} {:>11} {:>11.2} {:>7.1}",
            key.pid,
            key.comm.to_string(),
            key.direction.as_str(),
            key.device().to_string(),
            io.io,
            kbytes,
            avg_us,
            rate,
        )?;
    }

    Ok(())
}
