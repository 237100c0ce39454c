//! Input resolution between pipeline steps.
//!
//! Step 1 receives the uploaded files verbatim. Every later step receives the
//! previous step's outputs followed by any uploaded file that looks like a
//! reference (a sequence database, an annotation) so that long-lived inputs
//! stay reachable across the chain.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ToolMetadata;

/// Declared rules for recognizing reference files.
///
/// A file qualifies if it carries a reference extension or a reference
/// keyword, and carries neither a raw-read extension nor a raw-read keyword.
/// Matching is case-insensitive on the file name only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceRules {
    pub reference_extensions: Vec<String>,
    pub raw_read_extensions: Vec<String>,
    pub reference_keywords: Vec<String>,
    pub raw_read_keywords: Vec<String>,
}

impl Default for ReferenceRules {
    fn default() -> Self {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            reference_extensions: list(&[
                ".fasta", ".fa", ".fna", ".fas", ".fasta.gz", ".fa.gz", ".fna.gz", ".gb",
                ".gbk", ".gff", ".gff3", ".gtf", ".bed",
            ]),
            raw_read_extensions: list(&[
                ".fastq", ".fq", ".fastq.gz", ".fq.gz", ".bam", ".sam", ".cram",
            ]),
            reference_keywords: list(&["reference", "genome", "database", "_ref", "ref_"]),
            raw_read_keywords: list(&["read", "_r1", "_r2", "raw", "trimmed", "unpaired"]),
        }
    }
}

impl ReferenceRules {
    /// Whether `path` should be carried forward to later steps
    pub fn is_reference(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy().to_lowercase();

        let has_ext = |exts: &[String]| exts.iter().any(|e| name.ends_with(&e.to_lowercase()));
        let has_keyword = |kws: &[String]| kws.iter().any(|k| name.contains(&k.to_lowercase()));

        let raw_signal = has_ext(&self.raw_read_extensions) || has_keyword(&self.raw_read_keywords);
        if raw_signal {
            return false;
        }

        has_ext(&self.reference_extensions) || has_keyword(&self.reference_keywords)
    }
}

/// The resolver could not produce a usable input list
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("step {step} ({tool}) needs input files but none are available")]
    NoInputs { step: usize, tool: String },
}

/// Computes the concrete input list for a step
#[derive(Debug, Clone, Default)]
pub struct InputResolver {
    rules: ReferenceRules,
}

impl InputResolver {
    pub fn new(rules: ReferenceRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ReferenceRules {
        &self.rules
    }

    /// Resolve inputs for the 1-based `step_index`.
    ///
    /// `previous_outputs` are the files produced by step `step_index - 1`, in
    /// production order; ignored for step 1.
    pub fn resolve(
        &self,
        step_index: usize,
        tool: &ToolMetadata,
        previous_outputs: &[PathBuf],
        original_inputs: &[PathBuf],
    ) -> Result<Vec<PathBuf>, ResolutionError> {
        let resolved = if step_index <= 1 {
            original_inputs.to_vec()
        } else {
            let references = original_inputs
                .iter()
                .filter(|p| self.rules.is_reference(p));
            dedup_preserving_order(previous_outputs.iter().chain(references))
        };

        if resolved.is_empty() && tool.command_template.requires_inputs() {
            return Err(ResolutionError::NoInputs {
                step: step_index,
                tool: tool.name.clone(),
            });
        }

        Ok(resolved)
    }
}

/// First occurrence wins
fn dedup_preserving_order<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths
        .filter(|p| seen.insert(p.as_path()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(template: &str) -> ToolMetadata {
        let definition = format!(
            "# BIOFRAME_TOOL_METADATA\n# tool_primary_command: x\n# tool_command_template: {}\n",
            template
        );
        ToolMetadata::from_definition(&definition, "x").unwrap()
    }

    fn paths(items: &[&str]) -> Vec<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_reference_classification() {
        let rules = ReferenceRules::default();

        assert!(rules.is_reference(Path::new("/up/ecoli.fasta")));
        assert!(rules.is_reference(Path::new("/up/Genome.FA.gz")));
        assert!(rules.is_reference(Path::new("/up/annotation.gff3")));
        // keyword without a reference extension
        assert!(rules.is_reference(Path::new("/up/reference_index.bin")));

        assert!(!rules.is_reference(Path::new("/up/sample_R1.fastq.gz")));
        // raw-read keyword overrides a reference extension
        assert!(!rules.is_reference(Path::new("/up/trimmed_reads.fasta")));
        // raw-read extension overrides a reference keyword
        assert!(!rules.is_reference(Path::new("/up/reference_reads.fq")));
        assert!(!rules.is_reference(Path::new("/up/notes.txt")));
    }

    #[test]
    fn test_step_one_gets_originals_in_order() {
        let resolver = InputResolver::default();
        let originals = paths(&["/up/b_R2.fastq", "/up/a_R1.fastq", "/up/ref.fasta"]);
        let stale = paths(&["/run/step_0/x.txt"]);

        let inputs = resolver
            .resolve(1, &tool("t {input_files}"), &stale, &originals)
            .unwrap();
        assert_eq!(inputs, originals);
    }

    #[test]
    fn test_later_step_appends_references() {
        let resolver = InputResolver::default();
        let originals = paths(&["/up/s_R1.fastq", "/up/s_R2.fastq", "/up/ecoli.fasta"]);
        let previous = paths(&["/run/step_1/contigs.fasta", "/run/step_1/log.txt"]);

        let inputs = resolver
            .resolve(2, &tool("t {input_files}"), &previous, &originals)
            .unwrap();
        assert_eq!(
            inputs,
            paths(&[
                "/run/step_1/contigs.fasta",
                "/run/step_1/log.txt",
                "/up/ecoli.fasta"
            ])
        );
    }

    #[test]
    fn test_no_duplicate_when_output_is_also_reference() {
        let resolver = InputResolver::default();
        let originals = paths(&["/up/ecoli.fasta"]);
        let previous = paths(&["/up/ecoli.fasta", "/run/step_1/out.txt"]);

        let inputs = resolver
            .resolve(2, &tool("t {input_files}"), &previous, &originals)
            .unwrap();
        assert_eq!(inputs, paths(&["/up/ecoli.fasta", "/run/step_1/out.txt"]));
    }

    #[test]
    fn test_empty_previous_still_gets_references() {
        let resolver = InputResolver::default();
        let originals = paths(&["/up/s_R1.fastq", "/up/ecoli.fasta"]);

        let inputs = resolver
            .resolve(3, &tool("t {reference}"), &[], &originals)
            .unwrap();
        assert_eq!(inputs, paths(&["/up/ecoli.fasta"]));
    }

    #[test]
    fn test_no_inputs_for_input_consuming_tool() {
        let resolver = InputResolver::default();
        let originals = paths(&["/up/s_R1.fastq"]);

        let err = resolver
            .resolve(2, &tool("t {input_files}"), &[], &originals)
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NoInputs { step: 2, .. }));

        // A tool that reads no inputs is fine with an empty list
        let inputs = resolver
            .resolve(2, &tool("multiqc . -o {output_dir}"), &[], &originals)
            .unwrap();
        assert!(inputs.is_empty());
    }
}
