//! XDMF 2 metadata document for a time series.
//!
//! The document is kept as a model (header plus one block per step) and
//! rendered to text on demand. Rendering is a pure function of the model, so a
//! document loaded from disk, truncated and extended renders to the same bytes
//! as one written in a single run.
//!
//! Only rank 0 builds, loads or writes a document.

use crate::config::BackendKind;
use crate::data::variables::{FieldCenter, VariableTable};
use crate::io::raw::{CONNECT_STREAM, GEOMETRY_STREAM, PARTITION_STREAM};
use crate::io::DatasetPaths;
use crate::topology::cell_type::CellTopology;
use crate::topology::partition::GlobalLayout;
use crate::writer_error::{IoContext, Result, WriterError};
use roxmltree::{Document, Node, ParsingOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

const COLLECTION_NAME: &str = "TimeSeries";
const STEP_PREFIX: &str = "step_";
const PARTITION_ITEM: &str = "partition";

/// Everything the document says about the dataset besides its steps.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentHeader {
    pub backend: BackendKind,
    /// File name of the base path; locators are relative to the document.
    pub base_name: String,
    pub topology: CellTopology,
    pub total_cells: u64,
    pub total_vertices: u64,
    pub variables: VariableTable,
}

impl DocumentHeader {
    pub fn new(
        backend: BackendKind,
        paths: &DatasetPaths,
        layout: &GlobalLayout,
        variables: &VariableTable,
    ) -> Self {
        Self {
            backend,
            base_name: DatasetPaths::reference(paths.base()),
            topology: layout.topology,
            total_cells: layout.total_cells(),
            total_vertices: layout.total_vertices(),
            variables: variables.clone(),
        }
    }

    fn total(&self, center: FieldCenter) -> u64 {
        match center {
            FieldCenter::Cell => self.total_cells,
            FieldCenter::Node => self.total_vertices,
        }
    }

    fn stream(&self, name: &str) -> String {
        escape(&format!("{}_{name}.bin", self.base_name))
    }

    #[cfg(feature = "hdf5-support")]
    fn container(&self) -> String {
        escape(&format!("{}.h5", self.base_name))
    }

    /// Locator text of the connectivity item, used to recognise the backend on load.
    fn connect_locator(&self) -> String {
        match self.backend {
            BackendKind::Raw => self.stream(CONNECT_STREAM),
            #[cfg(feature = "hdf5-support")]
            BackendKind::Hdf5 => format!(
                "{}:/{}",
                self.container(),
                crate::io::hdf5::DATASET_CONNECT
            ),
        }
    }
}

/// One time step: its index, time value and which variables were written.
#[derive(Clone, Debug, PartialEq)]
pub struct StepBlock {
    pub index: u64,
    pub time: f64,
    /// Indexed like the variable table.
    pub fields: Vec<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetadataDocument {
    header: DocumentHeader,
    blocks: Vec<StepBlock>,
    first_index: u64,
}

impl MetadataDocument {
    /// Empty document starting at step 0.
    pub fn fresh(header: DocumentHeader) -> Self {
        Self::rewrite_from(header, 0)
    }

    /// Empty document whose first block will be `step`; earlier blocks are dropped.
    pub fn rewrite_from(header: DocumentHeader, step: u64) -> Self {
        Self {
            header,
            blocks: Vec::new(),
            first_index: step,
        }
    }

    /// Read and parse the document at `path`.
    pub fn load(path: &Path, header: DocumentHeader) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_path("read", path)?;
        Self::parse(&text, header).map_err(|err| match err {
            WriterError::StorageConsistency(msg) => {
                WriterError::StorageConsistency(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse a rendered document, checking that it describes `header`.
    pub fn parse(text: &str, header: DocumentHeader) -> Result<Self> {
        let options = ParsingOptions {
            allow_dtd: true,
            ..ParsingOptions::default()
        };
        let doc = Document::parse_with_options(text, options)
            .map_err(|e| WriterError::StorageConsistency(format!("unreadable XDMF: {e}")))?;
        let root = doc.root_element();
        if !root.has_tag_name("Xdmf") {
            return Err(inconsistent("root element is not <Xdmf>"));
        }
        let domain = child(root, "Domain")?;

        let topology = child(domain, "Topology")?;
        let topology_type = topology.attribute("TopologyType").unwrap_or_default();
        if CellTopology::from_xdmf_name(topology_type) != Some(header.topology) {
            return Err(inconsistent(format!(
                "document topology `{topology_type}` differs from {}",
                header.topology.xdmf_name()
            )));
        }
        expect_count(topology, "cells", header.total_cells)?;
        let connect = child(topology, "DataItem")?;
        let locator = connect.text().unwrap_or_default().trim();
        if locator != unescape_plain(&header.connect_locator()) {
            return Err(inconsistent(format!(
                "document references `{locator}`, expected `{}`",
                unescape_plain(&header.connect_locator())
            )));
        }
        expect_count(child(domain, "Geometry")?, "vertices", header.total_vertices)?;

        let collection = domain
            .children()
            .find(|n| n.has_tag_name("Grid") && n.attribute("CollectionType") == Some("Temporal"))
            .ok_or_else(|| inconsistent("document has no temporal collection"))?;

        let mut blocks = Vec::new();
        for grid in collection.children().filter(|n| n.has_tag_name("Grid")) {
            blocks.push(parse_block(grid, &header.variables)?);
        }
        let first_index = blocks.first().map(|b| b.index).unwrap_or(0);
        let parsed = Self {
            header,
            blocks,
            first_index,
        };
        if parsed.render()? != text {
            return Err(inconsistent(
                "document content differs from what this dataset renders",
            ));
        }
        Ok(parsed)
    }

    /// Keep blocks with index below `cutoff`. They must run without gaps up to `cutoff - 1`.
    pub fn truncate_to(&mut self, cutoff: u64) -> Result<()> {
        self.blocks.retain(|b| b.index < cutoff);
        let contiguous = self
            .blocks
            .windows(2)
            .all(|pair| pair[1].index == pair[0].index + 1);
        let reaches = self.blocks.last().map(|b| b.index + 1) == Some(cutoff);
        if !contiguous || !reaches {
            return Err(inconsistent(format!(
                "document holds steps {} but continuing at step {cutoff} needs every step before it",
                describe_range(&self.blocks)
            )));
        }
        Ok(())
    }

    pub fn header(&self) -> &DocumentHeader {
        &self.header
    }

    pub fn blocks(&self) -> &[StepBlock] {
        &self.blocks
    }

    /// Index the next pushed block must have.
    pub fn next_index(&self) -> u64 {
        self.blocks
            .last()
            .map(|b| b.index + 1)
            .unwrap_or(self.first_index)
    }

    /// Append a block without field entries.
    pub fn push_step(&mut self, index: u64, time: f64) -> Result<()> {
        let expected = self.next_index();
        if index != expected {
            return Err(WriterError::InvalidSequence(format!(
                "step {index} appended to a document expecting step {expected}"
            )));
        }
        self.blocks.push(StepBlock {
            index,
            time,
            fields: vec![false; self.header.variables.len()],
        });
        Ok(())
    }

    /// Mark `variable` as written in the newest block. Returns whether it already was.
    pub fn record_field(&mut self, variable: usize) -> Result<bool> {
        let block = self
            .blocks
            .last_mut()
            .ok_or_else(|| WriterError::InvalidSequence("no step to record a field in".into()))?;
        let slot = block.fields.get_mut(variable).ok_or_else(|| {
            WriterError::InvalidSequence(format!("variable index {variable} out of range"))
        })?;
        Ok(std::mem::replace(slot, true))
    }

    /// Serialize to XDMF text.
    pub fn render(&self) -> Result<String> {
        let mut out = Vec::new();
        self.write_xml(&mut out)
            .map_err(|e| inconsistent(format!("cannot render XDMF: {e}")))?;
        String::from_utf8(out).map_err(|e| inconsistent(format!("cannot render XDMF: {e}")))
    }

    /// Render to `path` through a temporary file and a rename.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let tmp = DatasetPaths::new(path).with_suffix(".tmp");
        let file = std::fs::File::create(&tmp).with_path("create", &tmp)?;
        let mut writer = BufWriter::new(file);
        self.write_xml(&mut writer).with_path("write", &tmp)?;
        writer.flush().with_path("flush", &tmp)?;
        std::fs::rename(&tmp, path).with_path("rename", &tmp)
    }

    /// Emit the document into `writer`.
    pub fn write_xml<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let h = &self.header;
        let vpc = h.topology.vertices_per_cell();
        writeln!(writer, "<?xml version=\"1.0\" ?>")?;
        writeln!(writer, "<!DOCTYPE Xdmf SYSTEM \"Xdmf.dtd\" []>")?;
        writeln!(writer, "<Xdmf Version=\"2.0\">")?;
        writeln!(writer, " <Domain>")?;

        writeln!(
            writer,
            "  <Topology TopologyType=\"{}\" NumberOfElements=\"{}\">",
            h.topology.xdmf_name(),
            h.total_cells
        )?;
        self.mesh_item(writer, "   ", "", CONNECT_STREAM, &format!("{} {vpc}", h.total_cells), "Int", 8)?;
        writeln!(writer, "  </Topology>")?;

        writeln!(
            writer,
            "  <Geometry GeometryType=\"XYZ\" NumberOfElements=\"{}\">",
            h.total_vertices
        )?;
        self.mesh_item(writer, "   ", "", GEOMETRY_STREAM, &format!("{} 3", h.total_vertices), "Float", 8)?;
        writeln!(writer, "  </Geometry>")?;

        self.mesh_item(
            writer,
            "  ",
            &format!(" Name=\"{PARTITION_ITEM}\""),
            PARTITION_STREAM,
            &h.total_cells.to_string(),
            "Int",
            4,
        )?;

        writeln!(
            writer,
            "  <Grid Name=\"{COLLECTION_NAME}\" GridType=\"Collection\" CollectionType=\"Temporal\">"
        )?;
        for block in &self.blocks {
            self.write_block(writer, block)?;
        }
        writeln!(writer, "  </Grid>")?;
        writeln!(writer, " </Domain>")?;
        writeln!(writer, "</Xdmf>")
    }

    #[allow(clippy::too_many_arguments)]
    fn mesh_item<W: Write>(
        &self,
        writer: &mut W,
        indent: &str,
        extra: &str,
        stream: &str,
        dimensions: &str,
        number_type: &str,
        precision: u8,
    ) -> io::Result<()> {
        let h = &self.header;
        match h.backend {
            BackendKind::Raw => writeln!(
                writer,
                "{indent}<DataItem{extra} Dimensions=\"{dimensions}\" NumberType=\"{number_type}\" Precision=\"{precision}\" Endian=\"Little\" Format=\"Binary\">{}</DataItem>",
                h.stream(stream)
            ),
            #[cfg(feature = "hdf5-support")]
            BackendKind::Hdf5 => writeln!(
                writer,
                "{indent}<DataItem{extra} Dimensions=\"{dimensions}\" NumberType=\"{number_type}\" Precision=\"{precision}\" Format=\"HDF\">{}:/{stream}</DataItem>",
                h.container()
            ),
        }
    }

    fn write_block<W: Write>(&self, writer: &mut W, block: &StepBlock) -> io::Result<()> {
        writeln!(
            writer,
            "   <Grid Name=\"{STEP_PREFIX}{:012}\" GridType=\"Uniform\">",
            block.index
        )?;
        writeln!(writer, "    <Topology Reference=\"/Xdmf/Domain/Topology[1]\"/>")?;
        writeln!(writer, "    <Geometry Reference=\"/Xdmf/Domain/Geometry[1]\"/>")?;
        writeln!(writer, "    <Time Value=\"{}\"/>", block.time)?;
        writeln!(writer, "    <Attribute Name=\"{PARTITION_ITEM}\" Center=\"Cell\">")?;
        writeln!(
            writer,
            "     <DataItem Reference=\"XML\">/Xdmf/Domain/DataItem[@Name=\"{PARTITION_ITEM}\"]</DataItem>"
        )?;
        writeln!(writer, "    </Attribute>")?;
        for (idx, var) in self.header.variables.iter().enumerate() {
            if !block.fields.get(idx).copied().unwrap_or(false) {
                continue;
            }
            writeln!(
                writer,
                "    <Attribute Name=\"{}\" Center=\"{}\">",
                var.name,
                var.center.xdmf_name()
            )?;
            self.field_item(writer, block.index, &var.name, self.header.total(var.center))?;
            writeln!(writer, "    </Attribute>")?;
        }
        writeln!(writer, "   </Grid>")
    }

    fn field_item<W: Write>(&self, writer: &mut W, step: u64, name: &str, total: u64) -> io::Result<()> {
        let h = &self.header;
        match h.backend {
            BackendKind::Raw => writeln!(
                writer,
                "     <DataItem Dimensions=\"{total}\" NumberType=\"Float\" Precision=\"8\" Endian=\"Little\" Format=\"Binary\" Seek=\"{}\">{}</DataItem>",
                step * total * 8,
                h.stream(name)
            ),
            #[cfg(feature = "hdf5-support")]
            BackendKind::Hdf5 => {
                let steps = self.next_index();
                writeln!(
                    writer,
                    "     <DataItem ItemType=\"HyperSlab\" Dimensions=\"1 {total}\" Type=\"HyperSlab\">"
                )?;
                writeln!(
                    writer,
                    "      <DataItem Dimensions=\"3 2\" Format=\"XML\">{step} 0 1 1 1 {total}</DataItem>"
                )?;
                writeln!(
                    writer,
                    "      <DataItem Dimensions=\"{steps} {total}\" NumberType=\"Float\" Precision=\"8\" Format=\"HDF\">{}:/{name}</DataItem>",
                    h.container()
                )?;
                writeln!(writer, "     </DataItem>")
            }
        }
    }
}

fn inconsistent(msg: impl Into<String>) -> WriterError {
    WriterError::StorageConsistency(msg.into())
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Result<Node<'a, 'input>> {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .ok_or_else(|| inconsistent(format!("<{}> has no <{tag}>", node.tag_name().name())))
}

fn expect_count(node: Node, what: &str, expected: u64) -> Result<()> {
    let found = node
        .attribute("NumberOfElements")
        .and_then(|v| v.parse::<u64>().ok());
    if found != Some(expected) {
        return Err(inconsistent(format!(
            "document describes {} {what}, the mesh has {expected}",
            found.map(|n| n.to_string()).unwrap_or_else(|| "an unknown number of".into())
        )));
    }
    Ok(())
}

fn parse_block(grid: Node, variables: &VariableTable) -> Result<StepBlock> {
    let name = grid.attribute("Name").unwrap_or_default();
    let index = name
        .strip_prefix(STEP_PREFIX)
        .and_then(|digits| digits.parse::<u64>().ok())
        .ok_or_else(|| inconsistent(format!("unexpected step grid `{name}`")))?;
    let time = child(grid, "Time")?
        .attribute("Value")
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| inconsistent(format!("step {index} has no readable time")))?;
    let mut fields = vec![false; variables.len()];
    for attr in grid.children().filter(|n| n.has_tag_name("Attribute")) {
        let attr_name = attr.attribute("Name").unwrap_or_default();
        if attr_name == PARTITION_ITEM {
            continue;
        }
        let idx = variables.index_of(attr_name).ok_or_else(|| {
            inconsistent(format!("step {index} holds unknown variable `{attr_name}`"))
        })?;
        let center = attr.attribute("Center").and_then(FieldCenter::from_xdmf_name);
        if center != variables.get(idx).map(|v| v.center) {
            return Err(inconsistent(format!(
                "variable `{attr_name}` is stored with a different centering"
            )));
        }
        fields[idx] = true;
    }
    Ok(StepBlock {
        index,
        time,
        fields,
    })
}

fn describe_range(blocks: &[StepBlock]) -> String {
    match (blocks.first(), blocks.last()) {
        (Some(first), Some(last)) => format!("{}..={}", first.index, last.index),
        _ => "none".into(),
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`], for comparing against parsed text.
fn unescape_plain(escaped: &str) -> String {
    escaped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::variables::Variable;
    use crate::writer_error::ErrorKind;

    fn header() -> DocumentHeader {
        DocumentHeader {
            backend: BackendKind::Raw,
            base_name: "run".into(),
            topology: CellTopology::Triangle,
            total_cells: 4,
            total_vertices: 5,
            variables: VariableTable::new(vec![Variable::cell("a"), Variable::node("b")]).unwrap(),
        }
    }

    fn three_steps() -> MetadataDocument {
        let mut doc = MetadataDocument::fresh(header());
        for (step, time) in [0.0, 0.25, 1e-3].into_iter().enumerate() {
            doc.push_step(step as u64, time).unwrap();
            doc.record_field(1).unwrap();
            doc.record_field(0).unwrap();
        }
        doc
    }

    #[test]
    fn renders_raw_locators() {
        let text = three_steps().render().unwrap();
        assert!(text.contains("<Topology TopologyType=\"Triangle\" NumberOfElements=\"4\">"));
        assert!(text.contains(">run_connect.bin</DataItem>"));
        assert!(text.contains("Dimensions=\"5 3\""));
        assert!(text.contains("<Grid Name=\"step_000000000002\" GridType=\"Uniform\">"));
        assert!(text.contains("<Time Value=\"0.001\"/>"));
        // a: 4 cells, step 2 -> 2 * 4 * 8
        assert!(text.contains("Seek=\"64\">run_a.bin</DataItem>"));
        // b: 5 vertices, step 1 -> 40
        assert!(text.contains("Seek=\"40\">run_b.bin</DataItem>"));
        let a = text.find("Attribute Name=\"a\"").unwrap();
        let b = text.find("Attribute Name=\"b\"").unwrap();
        assert!(a < b, "fields follow table order");
    }

    #[test]
    fn parsed_document_renders_identically() {
        let doc = three_steps();
        let text = doc.render().unwrap();
        let parsed = MetadataDocument::parse(&text, header()).unwrap();
        assert_eq!(parsed, doc);
        assert_eq!(parsed.render().unwrap(), text);
    }

    #[test]
    fn unwritten_fields_are_omitted() {
        let mut doc = MetadataDocument::fresh(header());
        doc.push_step(0, 0.0).unwrap();
        assert!(!doc.record_field(1).unwrap());
        assert!(doc.record_field(1).unwrap());
        let text = doc.render().unwrap();
        assert!(!text.contains("Attribute Name=\"a\""));
        assert!(text.contains("Attribute Name=\"b\" Center=\"Node\""));
    }

    #[test]
    fn truncation_then_append_matches_continuous_run() {
        let mut continuous = MetadataDocument::fresh(header());
        for step in 0..5 {
            continuous.push_step(step, step as f64 * 0.5).unwrap();
            continuous.record_field(0).unwrap();
        }

        let mut first = MetadataDocument::fresh(header());
        for step in 0..4 {
            first.push_step(step, step as f64 * 0.5).unwrap();
            first.record_field(0).unwrap();
        }
        let mut resumed = MetadataDocument::parse(&first.render().unwrap(), header()).unwrap();
        resumed.truncate_to(3).unwrap();
        assert_eq!(resumed.next_index(), 3);
        for step in 3..5 {
            resumed.push_step(step, step as f64 * 0.5).unwrap();
            resumed.record_field(0).unwrap();
        }
        assert_eq!(resumed.render().unwrap(), continuous.render().unwrap());
    }

    #[test]
    fn truncation_requires_coverage() {
        let mut doc = three_steps();
        let err = doc.truncate_to(5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageConsistency);

        let mut late = MetadataDocument::rewrite_from(header(), 2);
        late.push_step(2, 0.0).unwrap();
        late.truncate_to(3).unwrap();
        assert_eq!(late.blocks().len(), 1);
    }

    #[test]
    fn rejects_foreign_headers() {
        let text = three_steps().render().unwrap();
        let mut other = header();
        other.total_cells = 6;
        let err = MetadataDocument::parse(&text, other).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageConsistency);

        let mut renamed = header();
        renamed.base_name = "elsewhere".into();
        assert!(MetadataDocument::parse(&text, renamed).is_err());

        let swapped = VariableTable::new(vec![Variable::cell("b"), Variable::node("a")]).unwrap();
        let mut reordered = header();
        reordered.variables = swapped;
        assert!(MetadataDocument::parse(&text, reordered).is_err());

        assert!(MetadataDocument::parse("<Xdmf>", header()).is_err());
    }

    #[test]
    fn push_must_follow_cursor() {
        let mut doc = MetadataDocument::rewrite_from(header(), 3);
        let err = doc.push_step(0, 0.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSequence);
        doc.push_step(3, 0.0).unwrap();
        assert_eq!(doc.next_index(), 4);
    }

    #[test]
    fn write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.xdmf");
        std::fs::write(&path, "stale").unwrap();
        let doc = three_steps();
        doc.write_to(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), doc.render().unwrap());
        assert!(!dir.path().join("run.xdmf.tmp").exists());
    }

    #[test]
    fn written_document_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.xdmf");
        let doc = three_steps();
        doc.write_to(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("<!DOCTYPE Xdmf SYSTEM \"Xdmf.dtd\" []>"));
        assert_eq!(MetadataDocument::load(&path, header()).unwrap(), doc);
    }

    #[cfg(feature = "hdf5-support")]
    #[test]
    fn renders_hyperslabs_over_all_steps() {
        let mut h = header();
        h.backend = BackendKind::Hdf5;
        let mut doc = MetadataDocument::fresh(h.clone());
        for step in 0..3 {
            doc.push_step(step, 0.0).unwrap();
            doc.record_field(0).unwrap();
        }
        let text = doc.render().unwrap();
        assert!(text.contains("<DataItem Dimensions=\"3 2\" Format=\"XML\">2 0 1 1 1 4</DataItem>"));
        assert!(text.contains("Dimensions=\"3 4\" NumberType=\"Float\" Precision=\"8\" Format=\"HDF\">run.h5:/a</DataItem>"));
        assert_eq!(MetadataDocument::parse(&text, h).unwrap(), doc);
    }
}
