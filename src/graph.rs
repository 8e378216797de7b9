//! The graph sink: records the call relation observed during execution and
//! renders it as a DOT digraph.
//!
//! The sink keeps a stack of layers, one per live frame, each collecting the
//! names of the blocks called from that frame.  A block's own name is only
//! known when it returns, so attribution happens on `ret`: the popped
//! layer's children become edges out of the returning block, and the block's
//! name is appended to the parent layer.  `terminate` finalizes the root the
//! same way.  Calls are therefore observed in pre-order and edges emitted in
//! post-order; rendering deduplicates while keeping first-observed order.

use crate::sink::Sink;
use dot_writer::DotWriter;
use fnv::FnvHashSet;
use std::convert::Infallible;

/// Collects nodes and edges of the call relation; render with [`into_dot`].
///
/// [`into_dot`]: GraphSink::into_dot
#[derive(Debug, Default)]
pub struct GraphSink {
    layers: Vec<Vec<String>>,
    nodes: Vec<String>,
    edges: Vec<(String, String)>,
}

impl GraphSink {
    pub fn new() -> GraphSink {
        GraphSink {
            // The entry block's frame.
            layers: vec![Vec::new()],
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    fn finish_layer(&mut self, name: &[u8]) {
        let name = String::from_utf8_lossy(name).into_owned();
        let children = self.layers.pop().unwrap_or_default();
        if !self.nodes.contains(&name) {
            self.nodes.push(name.clone());
        }
        for child in children {
            self.edges.push((name.clone(), child));
        }
        if let Some(parent) = self.layers.last_mut() {
            parent.push(name);
        }
    }

    /// Renders the recorded relation as a DOT digraph.
    pub fn into_dot(self) -> String {
        let mut bytes = Vec::new();
        {
            let mut writer = DotWriter::from(&mut bytes);
            let mut digraph = writer.digraph();
            for node in &self.nodes {
                digraph.node_named(&quote(node));
            }
            let mut seen = FnvHashSet::default();
            for (from, to) in &self.edges {
                if seen.insert((from.clone(), to.clone())) {
                    digraph.edge(&quote(from), &quote(to));
                }
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// DOT identifiers: block names may contain spaces, so always quote.
fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

impl Sink for GraphSink {
    type Error = Infallible;

    fn write(&mut self, _bytes: &[u8], _nl: usize) -> Result<(), Infallible> {
        Ok(())
    }

    fn indent(&mut self, _columns: usize) -> Result<(), Infallible> {
        Ok(())
    }

    fn call(&mut self) -> Result<(), Infallible> {
        self.layers.push(Vec::new());
        Ok(())
    }

    fn ret(&mut self, name: &[u8]) -> Result<(), Infallible> {
        self.finish_layer(name);
        Ok(())
    }

    fn terminate(&mut self, name: &[u8]) -> Result<(), Infallible> {
        self.finish_layer(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_attribute_children_to_the_returning_block() {
        let mut sink = GraphSink::new();
        // main calls a, a calls b, then main calls b again.
        sink.call().unwrap();
        sink.call().unwrap();
        sink.ret(b"b").unwrap();
        sink.ret(b"a").unwrap();
        sink.call().unwrap();
        sink.ret(b"b").unwrap();
        sink.terminate(b"main").unwrap();

        assert_eq!(sink.nodes, vec!["b", "a", "main"]);
        assert_eq!(
            sink.edges,
            vec![
                ("a".to_string(), "b".to_string()),
                ("main".to_string(), "a".to_string()),
                ("main".to_string(), "b".to_string()),
            ]
        );
    }

    #[test]
    fn rendering_deduplicates_edges() {
        let mut sink = GraphSink::new();
        sink.call().unwrap();
        sink.ret(b"x").unwrap();
        sink.call().unwrap();
        sink.ret(b"x").unwrap();
        sink.terminate(b"root").unwrap();
        let dot = sink.into_dot();
        assert_eq!(dot.matches("\"root\" -> \"x\"").count(), 1);
        assert!(dot.contains("digraph"));
    }
}
