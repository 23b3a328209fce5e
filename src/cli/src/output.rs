//! Output formatting utilities for the Rollup CLI.
//!
//! Supports table, JSON, and YAML output formats.

use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

/// Output format selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Render as a formatted table
    #[default]
    Table,
    /// Render as JSON
    Json,
    /// Render as YAML
    Yaml,
}

/// Print a success message to stdout.
pub fn print_success(msg: &str) {
    println!("{} {}", "[OK]".green().bold(), msg);
}

/// Print an error message to stderr.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), msg);
}

/// Print an informational message to stdout.
pub fn print_info(msg: &str) {
    println!("{} {}", "[INFO]".blue().bold(), msg);
}

/// Print a list of items in the requested format.
///
/// For table output, items must implement `Tabled`. For JSON/YAML, items must
/// implement `Serialize`.
pub fn print_list<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No results found.".dimmed());
                return;
            }
            let table = Table::new(items)
                .with(Style::rounded())
                .with(Modify::new(Columns::first()).with(Alignment::left()))
                .to_string();
            println!("{}", table);
        }
        OutputFormat::Json | OutputFormat::Yaml => print_serialized(items, format),
    }
}

/// Print a single item in the requested format.
///
/// Table output falls back to pretty JSON.
pub fn print_item<T: Serialize + ?Sized>(item: &T, format: OutputFormat) {
    print_serialized(item, format);
}

fn print_serialized<T: Serialize + ?Sized>(item: &T, format: OutputFormat) {
    let rendered = match format {
        OutputFormat::Table | OutputFormat::Json => serde_json::to_string_pretty(item)
            .map(|json| format!("{}\n", json))
            .map_err(|e| e.to_string()),
        OutputFormat::Yaml => serde_yaml::to_string(item).map_err(|e| e.to_string()),
    };
    match rendered {
        Ok(text) => print!("{}", text),
        Err(e) => print_error(&format!("Failed to render output: {}", e)),
    }
}

/// Print key-value details to the terminal (non-JSON/YAML output).
pub fn print_detail(key: &str, value: &str) {
    println!("  {}: {}", key.cyan(), value);
}

/// Print a section header.
pub fn print_header(title: &str) {
    println!();
    println!("{}", title.bold().underline());
    println!();
}
