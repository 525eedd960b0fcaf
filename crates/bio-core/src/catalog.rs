//! Module catalog: metadata for the bioinformatics tools a workflow may use.
//!
//! The catalog is offered to the planner so it only proposes known modules.
//! It is loaded from a JSON or YAML list, or falls back to the built-in set.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read module catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse module catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse module catalog YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("duplicate module name: {0}")]
    Duplicate(String),
}

/// Metadata describing one bioinformatics module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub language: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Example input file names.
    #[serde(default, rename = "input")]
    pub inputs: Vec<String>,
    /// Example output file names.
    #[serde(default, rename = "output")]
    pub outputs: Vec<String>,
    /// Representative command line.
    pub execution: String,
    #[serde(default)]
    pub test_case: Option<String>,
}

/// Ordered set of modules keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleCatalog {
    modules: Vec<ModuleInfo>,
}

impl ModuleCatalog {
    pub fn new(modules: Vec<ModuleInfo>) -> Result<Self, CatalogError> {
        let mut seen = std::collections::HashSet::new();
        for module in &modules {
            if !seen.insert(module.name.to_lowercase()) {
                return Err(CatalogError::Duplicate(module.name.clone()));
            }
        }
        Ok(Self { modules })
    }

    /// Load a catalog file. `.yaml`/`.yml` files are read as YAML, anything else as JSON.
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        let modules: Vec<ModuleInfo> = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Self::new(modules)
    }

    /// Case-insensitive lookup by module name.
    pub fn get(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The modules shipped with the orchestrator.
    pub fn builtin() -> Self {
        fn module(
            name: &str,
            version: &str,
            language: &str,
            dependencies: &[&str],
            inputs: &[&str],
            outputs: &[&str],
            execution: &str,
            test_case: &str,
        ) -> ModuleInfo {
            let owned = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
            ModuleInfo {
                name: name.to_string(),
                version: version.to_string(),
                language: language.to_string(),
                dependencies: owned(dependencies),
                inputs: owned(inputs),
                outputs: owned(outputs),
                execution: execution.to_string(),
                test_case: Some(test_case.to_string()),
            }
        }

        Self {
            modules: vec![
                module(
                    "FastQC",
                    "0.11.9",
                    "Java",
                    &["Java >= 8"],
                    &["raw_reads.fastq.gz"],
                    &["fastqc_report.html", "fastqc_data.txt"],
                    "fastqc raw_reads.fastq.gz",
                    "test_data/example_reads.fastq.gz",
                ),
                module(
                    "BWA",
                    "0.7.17",
                    "C",
                    &["bwa"],
                    &["reference.fasta", "reads.fastq.gz"],
                    &["aligned_reads.sam"],
                    "bwa mem reference.fasta reads.fastq.gz > aligned_reads.sam",
                    "test_data/example_reads.fastq.gz",
                ),
                module(
                    "GATK",
                    "4.2.0.0",
                    "Java",
                    &["Java >= 8", "gatk"],
                    &["aligned_reads.bam", "reference.fasta"],
                    &["variants.vcf"],
                    "gatk HaplotypeCaller -I aligned_reads.bam -R reference.fasta -O variants.vcf",
                    "test_data/example_aligned_reads.bam",
                ),
                module(
                    "Biopython",
                    "1.81",
                    "Python",
                    &["biopython"],
                    &["sequences.fasta"],
                    &["parsed_sequences.json"],
                    "python parse_sequences.py sequences.fasta",
                    "test_data/example_sequences.fasta",
                ),
                module(
                    "Bioconductor",
                    "3.15",
                    "R",
                    &["R >=4.0", "BiocManager"],
                    &["expression_matrix.csv"],
                    &["differential_expression_results.csv"],
                    "Rscript run_bioconductor.R expression_matrix.csv",
                    "test_data/example_expression_matrix.csv",
                ),
            ],
        }
    }
}
