//! Tool metadata and its extraction from a build definition.
//!
//! Each tool image carries a metadata block in its Dockerfile:
//!
//! ```text
//! # BIOFRAME_TOOL_METADATA
//! # tool_name: FastQC
//! # tool_primary_command: fastqc
//! # tool_command_template: fastqc {input_files} -o {output_dir} -t {threads}
//! # tool_expected_outputs: *_fastqc.html
//! #
//! ```
//!
//! The block ends at a bare `#`, the first non-comment line, or end of text.
//! Unknown keys are ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::template::CommandTemplate;

/// Marker line that opens the metadata block
pub const METADATA_MARKER: &str = "# BIOFRAME_TOOL_METADATA";

const DEFAULT_MEMORY_GB: u32 = 4;
const DEFAULT_CPUS: u32 = 1;

/// Declared contract of a single tool image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    pub category: String,

    /// Accepted input formats, in declared order
    pub input_formats: Vec<String>,

    /// Produced output formats, in declared order
    pub output_formats: Vec<String>,

    /// Available subcommands
    pub commands: Vec<String>,

    /// Designated primary command (never empty)
    pub primary_command: String,

    /// Parsed command template (never empty)
    pub command_template: CommandTemplate,

    /// Declared memory requirement in GB
    pub memory_gb: u32,

    /// Declared CPU-core requirement
    pub cpus: u32,

    /// Expected output filename patterns, relative to the step output dir
    pub expected_outputs: Vec<String>,

    pub success_indicators: Vec<String>,
    pub failure_indicators: Vec<String>,

    /// Presentation-only fields, passed through untouched
    pub presentation: Presentation,
}

/// Opaque display metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presentation {
    pub author: Option<String>,
    pub url: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

/// Why a tool's metadata block was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("no '{METADATA_MARKER}' block found")]
    MissingBlock,

    #[error("required field '{0}' is missing or empty")]
    MissingField(&'static str),

    #[error("field '{field}' has malformed value '{value}'")]
    Malformed { field: &'static str, value: String },
}

impl ToolMetadata {
    /// Extract metadata from a build definition.
    ///
    /// `fallback_name` is used when the block has no `tool_name`, normally the
    /// tool name taken from the image reference.
    pub fn from_definition(definition: &str, fallback_name: &str) -> Result<Self, MetadataError> {
        let fields = metadata_block(definition).ok_or(MetadataError::MissingBlock)?;

        let mut name = None;
        let mut description = None;
        let mut version = None;
        let mut category = None;
        let mut input_formats = Vec::new();
        let mut output_formats = Vec::new();
        let mut commands = Vec::new();
        let mut primary_command = None;
        let mut command_template = None;
        let mut memory_gb = DEFAULT_MEMORY_GB;
        let mut cpus = DEFAULT_CPUS;
        let mut expected_outputs = Vec::new();
        let mut success_indicators = Vec::new();
        let mut failure_indicators = Vec::new();
        let mut presentation = Presentation::default();

        for (key, value) in fields {
            match key.as_str() {
                "tool_name" => name = non_empty(value),
                "tool_description" => description = non_empty(value),
                "tool_version" => version = non_empty(value),
                "tool_category" => category = non_empty(value),
                "tool_input_formats" => input_formats = split_list(value),
                "tool_output_formats" => output_formats = split_list(value),
                "tool_author" => presentation.author = non_empty(value),
                "tool_url" => presentation.url = non_empty(value),
                "tool_icon" => presentation.icon = non_empty(value),
                "tool_color" => presentation.color = non_empty(value),
                "tool_commands" => commands = split_list(value),
                "tool_primary_command" => primary_command = non_empty(value),
                "tool_command_template" => command_template = non_empty(value),
                "tool_memory_requirement" => {
                    if !value.is_empty() {
                        memory_gb = parse_memory_gb(value)?;
                    }
                }
                "tool_cpu_requirement" => {
                    if !value.is_empty() {
                        cpus = parse_cpus(value)?;
                    }
                }
                "tool_expected_outputs" => expected_outputs = split_list(value),
                "tool_success_indicators" => success_indicators = split_list(value),
                "tool_failure_indicators" => failure_indicators = split_list(value),
                _ => {}
            }
        }

        let primary_command =
            primary_command.ok_or(MetadataError::MissingField("tool_primary_command"))?;
        let command_template =
            command_template.ok_or(MetadataError::MissingField("tool_command_template"))?;

        let name = name.unwrap_or_else(|| fallback_name.to_string());

        Ok(Self {
            description: description.unwrap_or_else(|| format!("Bioinformatics tool: {}", name)),
            name,
            version: version.unwrap_or_else(|| "latest".to_string()),
            category: category.unwrap_or_else(|| "Bioinformatics".to_string()),
            input_formats,
            output_formats,
            commands,
            primary_command,
            command_template: CommandTemplate::parse(&command_template),
            memory_gb,
            cpus,
            expected_outputs,
            success_indicators,
            failure_indicators,
            presentation,
        })
    }
}

/// Collect `(lowercased key, trimmed value)` pairs from the metadata block
fn metadata_block(definition: &str) -> Option<Vec<(String, &str)>> {
    let mut lines = definition.lines().map(str::trim);
    lines.find(|line| *line == METADATA_MARKER)?;

    let mut fields = Vec::new();
    for line in lines {
        let Some(body) = line.strip_prefix('#') else {
            break;
        };
        let body = body.trim();
        if body.is_empty() {
            break;
        }
        if let Some((key, value)) = body.split_once(':') {
            fields.push((key.trim().to_ascii_lowercase(), value.trim()));
        }
    }

    Some(fields)
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Split a comma-separated list, trimming elements and dropping empty ones
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `16`, `16G`, `16GB`, `512M`, `512MB` into whole gigabytes (minimum 1)
fn parse_memory_gb(value: &str) -> Result<u32, MetadataError> {
    let malformed = || MetadataError::Malformed {
        field: "tool_memory_requirement",
        value: value.to_string(),
    };

    let upper = value.trim().to_ascii_uppercase();
    let unit_start = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (digits, unit) = upper.split_at(unit_start);
    let amount: u64 = digits.parse().map_err(|_| malformed())?;

    let gb = match unit.trim() {
        "" | "G" | "GB" => amount,
        "M" | "MB" => amount.div_ceil(1024),
        "T" | "TB" => amount.checked_mul(1024).ok_or_else(malformed)?,
        _ => return Err(malformed()),
    };

    u32::try_from(gb.max(1)).map_err(|_| malformed())
}

fn parse_cpus(value: &str) -> Result<u32, MetadataError> {
    match value.trim().parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(MetadataError::Malformed {
            field: "tool_cpu_requirement",
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPADES_DOCKERFILE: &str = r#"FROM ubuntu:22.04

# BIOFRAME_TOOL_METADATA
# tool_name: SPAdes
# tool_description: Genome assembler
# tool_version: 3.15.5
# tool_category: Assembly
# tool_input_formats: .fastq, .fq , ,.fastq.gz
# tool_output_formats: .fasta,.fastg
# tool_commands: spades.py, metaspades.py
# tool_primary_command:   spades.py
# tool_command_template:  spades.py -1 {read1} -2 {read2} -t {threads} -m {memory} -o {output_dir}
# tool_memory_requirement: 16G
# tool_cpu_requirement: 8
# tool_expected_outputs: contigs.fasta, scaffolds.fasta
# tool_success_indicators: Thank you for using SPAdes!
# tool_failure_indicators: == Error ==, Traceback
# tool_icon: fas fa-dna
# tool_unknown_key: ignored
#

RUN apt-get update
"#;

    #[test]
    fn test_full_block_extraction() {
        let meta = ToolMetadata::from_definition(SPADES_DOCKERFILE, "spades").unwrap();

        assert_eq!(meta.name, "SPAdes");
        assert_eq!(meta.version, "3.15.5");
        assert_eq!(meta.input_formats, vec![".fastq", ".fq", ".fastq.gz"]);
        assert_eq!(meta.commands, vec!["spades.py", "metaspades.py"]);
        assert_eq!(meta.primary_command, "spades.py");
        assert_eq!(
            meta.command_template.source(),
            "spades.py -1 {read1} -2 {read2} -t {threads} -m {memory} -o {output_dir}"
        );
        assert_eq!(meta.memory_gb, 16);
        assert_eq!(meta.cpus, 8);
        assert_eq!(meta.expected_outputs, vec!["contigs.fasta", "scaffolds.fasta"]);
        assert_eq!(meta.failure_indicators, vec!["== Error ==", "Traceback"]);
        assert_eq!(meta.presentation.icon.as_deref(), Some("fas fa-dna"));
    }

    #[test]
    fn test_defaults_for_optional_fields() {
        let definition = "# BIOFRAME_TOOL_METADATA\n# tool_primary_command: fastqc\n# tool_command_template: fastqc {input_files}\n";
        let meta = ToolMetadata::from_definition(definition, "fastqc").unwrap();

        assert_eq!(meta.name, "fastqc");
        assert_eq!(meta.description, "Bioinformatics tool: fastqc");
        assert_eq!(meta.version, "latest");
        assert_eq!(meta.memory_gb, DEFAULT_MEMORY_GB);
        assert_eq!(meta.cpus, 1);
        assert!(meta.expected_outputs.is_empty());
    }

    #[test]
    fn test_missing_template_is_rejected() {
        let definition = "# BIOFRAME_TOOL_METADATA\n# tool_primary_command: fastqc\n#\n";
        let err = ToolMetadata::from_definition(definition, "fastqc").unwrap_err();
        assert_eq!(err, MetadataError::MissingField("tool_command_template"));
    }

    #[test]
    fn test_blank_primary_command_is_rejected() {
        let definition =
            "# BIOFRAME_TOOL_METADATA\n# tool_primary_command:   \n# tool_command_template: x\n";
        let err = ToolMetadata::from_definition(definition, "x").unwrap_err();
        assert_eq!(err, MetadataError::MissingField("tool_primary_command"));
    }

    #[test]
    fn test_block_ends_at_bare_hash() {
        let definition = "# BIOFRAME_TOOL_METADATA\n# tool_primary_command: a\n#\n# tool_command_template: a {input_files}\n";
        assert_eq!(
            ToolMetadata::from_definition(definition, "a").unwrap_err(),
            MetadataError::MissingField("tool_command_template")
        );
    }

    #[test]
    fn test_missing_block() {
        let err = ToolMetadata::from_definition("FROM alpine\n", "a").unwrap_err();
        assert_eq!(err, MetadataError::MissingBlock);
    }

    #[test]
    fn test_memory_parsing() {
        assert_eq!(parse_memory_gb("16").unwrap(), 16);
        assert_eq!(parse_memory_gb("16gb").unwrap(), 16);
        assert_eq!(parse_memory_gb("512M").unwrap(), 1);
        assert_eq!(parse_memory_gb("2048MB").unwrap(), 2);
        assert!(parse_memory_gb("lots").is_err());
        assert!(parse_memory_gb("8Q").is_err());
    }

    #[test]
    fn test_oversized_memory_is_malformed() {
        assert_eq!(parse_memory_gb("2T").unwrap(), 2048);
        assert!(parse_memory_gb("18014398509481984T").is_err());
        assert!(parse_memory_gb("99999999999999999999").is_err());

        let definition = "# BIOFRAME_TOOL_METADATA\n# tool_primary_command: a\n# tool_command_template: a\n# tool_memory_requirement: 18014398509481984T\n";
        assert!(matches!(
            ToolMetadata::from_definition(definition, "a"),
            Err(MetadataError::Malformed { field: "tool_memory_requirement", .. })
        ));
    }

    #[test]
    fn test_malformed_cpu_is_rejected() {
        let definition = "# BIOFRAME_TOOL_METADATA\n# tool_primary_command: a\n# tool_command_template: a\n# tool_cpu_requirement: 0\n";
        assert!(matches!(
            ToolMetadata::from_definition(definition, "a"),
            Err(MetadataError::Malformed { field: "tool_cpu_requirement", .. })
        ));
    }
}
