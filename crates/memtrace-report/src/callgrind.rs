//! Call-graph profile export in the classic callgrind text grammar.
//!
//! Each interned callsite record is walked leaf-to-root exactly once, leading
//! instrumentation frames are dropped, and call paths sharing a resolved
//! function name are merged into one `fn=` block with per-line event counts
//! and `cfn=`/`calls=` callee edges. The event unit is allocations, not
//! cycles. Grammar compliance matters: the output is consumed by third-party
//! viewers, not by this crate.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memtrace_core::tracker::MemTracker;

use crate::error::Result;

/// Leading (leaf-side) frames whose name starts with one of these are the
/// tracker's own entry frames and are dropped from every path.
const DROP_PREFIXES: &[&str] = &["memtrace"];

/// One frame after symbol resolution.
#[derive(Debug, Clone)]
struct ResolvedFrame {
    name: String,
    file: String,
    line: u32,
}

/// Call edge from one caller line to one callee.
#[derive(Debug, Default)]
struct CallEdge {
    callee_file: String,
    callee_line: u32,
    calls: u64,
    events: u64,
}

/// One merged function block.
#[derive(Debug, Default)]
struct FunctionNode {
    file: String,
    /// Source line -> self event count (events attributed to the leaf).
    self_events: BTreeMap<u32, u64>,
    /// (callee name, caller line) -> edge.
    edges: BTreeMap<(String, u32), CallEdge>,
}

fn is_instrumentation(name: &str) -> bool {
    DROP_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Resolve one record into a leaf-to-root chain of named frames.
fn resolve_chain(tracker: &MemTracker, id: memtrace_core::callsite::CallsiteId) -> Vec<ResolvedFrame> {
    let record = tracker.decode_callsite(id);
    let mut chain: Vec<ResolvedFrame> = record
        .frames
        .iter()
        .map(|f| ResolvedFrame {
            name: tracker.resolve_string(f.name),
            file: tracker.resolve_string(f.file),
            line: f.line,
        })
        .collect();

    for &addr in &record.native {
        match tracker.resolve_symbol(addr) {
            Some(sym) => chain.push(ResolvedFrame {
                name: sym.name,
                file: sym.file,
                line: sym.line,
            }),
            None => chain.push(ResolvedFrame {
                name: format!("{addr:#x}"),
                file: "??".to_string(),
                line: 0,
            }),
        }
    }

    // Drop the tracker's own leaf frames.
    let skip = chain.iter().take_while(|f| is_instrumentation(&f.name)).count();
    chain.drain(..skip);
    chain
}

/// Merge every interned record into name-keyed function nodes.
fn build_graph(tracker: &MemTracker) -> BTreeMap<String, FunctionNode> {
    let mut graph: BTreeMap<String, FunctionNode> = BTreeMap::new();

    for raw in 0..tracker.callsite_count() as u32 {
        let id = memtrace_core::callsite::CallsiteId(raw);
        let events = tracker.callsite_stats(id).alloc_count;
        let chain = resolve_chain(tracker, id);
        if chain.is_empty() {
            let node = graph.entry("<unknown>".to_string()).or_default();
            if node.file.is_empty() {
                node.file = "??".to_string();
            }
            *node.self_events.entry(0).or_insert(0) += events;
            continue;
        }

        // Self cost lands on the leaf at its line.
        let leaf = &chain[0];
        let node = graph.entry(leaf.name.clone()).or_default();
        if node.file.is_empty() {
            node.file = leaf.file.clone();
        }
        *node.self_events.entry(leaf.line).or_insert(0) += events;

        // One edge per adjacent caller/callee pair, walking toward the root.
        for pair in chain.windows(2) {
            let (callee, caller) = (&pair[0], &pair[1]);
            let node = graph.entry(caller.name.clone()).or_default();
            if node.file.is_empty() {
                node.file = caller.file.clone();
            }
            let edge = node
                .edges
                .entry((callee.name.clone(), caller.line))
                .or_default();
            if edge.callee_file.is_empty() {
                edge.callee_file = callee.file.clone();
                edge.callee_line = callee.line;
            }
            edge.calls += events;
            edge.events += events;
        }
    }
    graph
}

/// Write the call-graph profile.
pub fn write_callgrind<W: Write>(tracker: &MemTracker, out: &mut W) -> Result<()> {
    writeln!(out, "events: Allocations")?;

    for (name, node) in build_graph(tracker) {
        writeln!(out)?;
        writeln!(out, "fl={}", node.file)?;
        writeln!(out, "fn={name}")?;
        for (line, events) in &node.self_events {
            writeln!(out, "{line} {events}")?;
        }
        for ((callee, caller_line), edge) in &node.edges {
            writeln!(out, "cfl={}", edge.callee_file)?;
            writeln!(out, "cfn={callee}")?;
            writeln!(out, "calls={} {}", edge.calls, edge.callee_line)?;
            writeln!(out, "{caller_line} {}", edge.events)?;
        }
    }
    Ok(())
}

/// Write the call-graph profile to `path`.
pub fn export_call_graph<P: AsRef<Path>>(tracker: &MemTracker, path: P) -> Result<()> {
    let file = match File::create(path.as_ref()) {
        Ok(f) => f,
        Err(err) => {
            tracing::warn!(path = %path.as_ref().display(), %err, "call-graph export failed");
            return Err(err.into());
        }
    };
    let mut out = BufWriter::new(file);
    write_callgrind(tracker, &mut out)?;
    out.flush()?;
    Ok(())
}
