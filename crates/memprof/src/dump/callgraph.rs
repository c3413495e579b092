use std::io::{self, Write};

use crate::frame::{Cost, Frame};

const FILE: &str = "unknown";

/// Writes the tree in callgrind format.
///
/// Frames are emitted children first. Each frame carries its self cost, then
/// one call record per child with that child's inclusive cost. The root's
/// inclusive cost closes the file as the `total:` line.
pub(crate) fn write(root: &Frame, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "version: 1")?;
    writeln!(out, "cmd: {FILE}")?;
    writeln!(out, "positions: line")?;
    writeln!(out, "events: MemorySize BlocksCount")?;
    writeln!(out)?;

    let total = write_frame(root, out)?;

    writeln!(out, "total: {} {}", total.bytes, total.blocks)
}

fn write_frame(frame: &Frame, out: &mut dyn Write) -> io::Result<Cost> {
    let children = frame.sorted_children();
    let mut inclusive = Vec::with_capacity(children.len());
    let mut total = Cost::default();

    for child in &children {
        let cost = write_frame(child, out)?;
        total += cost;
        inclusive.push(cost);
    }

    let self_cost = frame.self_cost();
    total += self_cost;

    writeln!(out, "fl={FILE}")?;
    writeln!(out, "fn={}", frame.name())?;
    writeln!(out, "1 {} {}", self_cost.bytes, self_cost.blocks)?;

    for (child, cost) in children.iter().zip(&inclusive) {
        writeln!(out, "cfl={FILE}")?;
        writeln!(out, "cfn={}", child.name())?;
        writeln!(out, "calls={} 1", child.calls())?;
        writeln!(out, "1 {} {}", cost.bytes, cost.blocks)?;
    }

    writeln!(out)?;

    Ok(total)
}
