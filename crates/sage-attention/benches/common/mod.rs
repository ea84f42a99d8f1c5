use std::{fs, io::Write, path::Path};

const RESULTS_PATH: &str = "crates/sage-attention/benchmarks/RESULTS.md";

pub fn format_markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut table = String::new();
    table.push_str("| ");
    table.push_str(&headers.join(" | "));
    table.push_str(" |\n| ");
    table.push_str(&headers.iter().map(|_| "---").collect::<Vec<_>>().join(" | "));
    table.push_str(" |\n");
    for row in rows {
        table.push_str("| ");
        table.push_str(&row.join(" | "));
        table.push_str(" |\n");
    }
    table
}

/// Replace (or append) the `section` block of the results file.
pub fn update_results(section: &str, content: &str) -> std::io::Result<()> {
    let section_upper = section.to_uppercase();
    let start_marker = format!("<!-- {section_upper}_START -->");
    let end_marker = format!("<!-- {section_upper}_END -->");

    let path = Path::new(RESULTS_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut body = if path.exists() {
        fs::read_to_string(path)?
    } else {
        "# Quantized Attention Benchmarks\n\n".to_string()
    };

    let section_block = format!("{start_marker}\n{content}\n{end_marker}\n");
    match (body.find(&start_marker), body.find(&end_marker)) {
        (Some(start_idx), Some(end_idx)) => {
            let end_bound = (end_idx + end_marker.len() + 1).min(body.len());
            body.replace_range(start_idx..end_bound, &section_block);
        }
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&section_block);
        }
    }

    let mut file = fs::File::create(path)?;
    file.write_all(body.as_bytes())?;
    Ok(())
}

pub fn format_rate(per_sec: f64) -> String {
    if per_sec >= 1e6 {
        format!("{:.2} M", per_sec / 1e6)
    } else if per_sec >= 1e3 {
        format!("{:.2} K", per_sec / 1e3)
    } else {
        format!("{per_sec:.2}")
    }
}
