// Terminal output helpers shared by the commands

use colored::Colorize;

const HEADER_WIDTH: usize = 60;

/// Boxed title, widened for long topology names
pub fn print_header(title: &str) {
    let width = HEADER_WIDTH.max(title.chars().count() + 4);
    let rule = "═".repeat(width);

    println!();
    println!("{}", format!("╔{}╗", rule).bright_blue());
    println!("{}", format!("║  {:<w$}║", title, w = width - 2).bright_blue());
    println!("{}", format!("╚{}╝", rule).bright_blue());
    println!();
}

pub fn print_success(message: &str) {
    println!("{}", format!("✅ {}", message).bright_green().bold());
}

/// Errors go to stderr so piped output stays parseable
pub fn print_error(message: &str) {
    eprintln!("{}", format!("❌ {}", message).bright_red().bold());
}
