use owo_colors::OwoColorize as _;
use regex::Regex;
use std::sync::OnceLock;

fn ansi_regex() -> &'static Regex {
  static ANSI_RE: OnceLock<Regex> = OnceLock::new();
  ANSI_RE.get_or_init(|| {
    Regex::new(
      r"(?x)
      \x1B\[[0-?]*[ -/]*[@-~]    # CSI sequence
      |                            # or
      \x1B\][^\x07\x1B]*(?:\x07|\x1B\\)  # OSC sequence terminated by BEL or ST
    ",
    )
    .expect("valid ANSI regex")
  })
}

/// Print a simple ASCII table to stdout.
/// Column widths are derived from headers and string lengths of rows.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
  let cols = headers.len();
  // 1) Measure max width per column across header and values (visible length)
  let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
  for row in rows {
    for (i, cell) in row.iter().enumerate().take(cols) {
      let vlen = visible_len(cell);
      if vlen > widths[i] {
        widths[i] = vlen;
      }
    }
  }

  // 2) Render headers: header + spaces(col_max - header.len + 1) between columns
  let mut header_line = String::new();
  for (i, text) in headers.iter().enumerate() {
    header_line.push_str(text);
    if i + 1 < cols {
      let spaces = widths[i].saturating_sub(text.len()) + 1;
      header_line.push_str(&" ".repeat(spaces));
    }
  }
  anstream::println!("{}", header_line.dimmed());

  // 3) Render rows with the same spacing rule based on visible lengths
  for row in rows {
    let mut line = String::new();
    for (i, cell) in row.iter().enumerate().take(cols) {
      line.push_str(cell);
      if i + 1 < cols {
        let spaces = widths[i].saturating_sub(visible_len(cell)) + 1;
        line.push_str(&" ".repeat(spaces));
      }
    }
    anstream::println!("{}", line);
  }
}

pub fn strip_ansi_control_codes(input: &str) -> String {
  ansi_regex().replace_all(input, "").into_owned()
}

fn visible_len(s: &str) -> usize {
  // Strip ANSI CSI and OSC sequences, then count remaining characters.
  strip_ansi_control_codes(s).chars().count()
}
