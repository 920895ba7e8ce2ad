//! Operator-facing output on stdout. Logs go to stderr through [`super::logging`].

use std::fmt::Display;

use colored::*;

pub const TOTAL_WIDTH: usize = 64;
const KEY_WIDTH: usize = 16;

const PRIMARY: Color = Color::BrightGreen;
const SEPARATOR: Color = Color::BrightBlack;
const TEXT_DEFAULT: Color = Color::White;

pub fn header(msg: &str) {
    let formatted: String = format!("⟦ {} ⟧", msg);
    let msg_len: usize = formatted.chars().count();

    let dash_count: usize = TOTAL_WIDTH.saturating_sub(msg_len);
    let left: usize = dash_count / 2;
    let right: usize = dash_count - left;

    let line: ColoredString = format!(
        "{}{}{}",
        "─".repeat(left),
        formatted.to_uppercase().bright_green(),
        "─".repeat(right)
    )
    .bright_black();

    println!("{}", line);
}

pub fn fat_separator() {
    let sep: ColoredString = "═".repeat(TOTAL_WIDTH).bright_black();
    println!("{}", sep);
}

pub fn aligned_line<V: Display>(key: &str, value: V) {
    let dots: String = ".".repeat((KEY_WIDTH + 1).saturating_sub(key.chars().count()));
    let colon: String = format!("{}{}", dots.color(SEPARATOR), ":".color(SEPARATOR));
    let prefix: ColoredString = ">".color(SEPARATOR);
    println!(
        "{} {}{} {}",
        prefix,
        key.color(PRIMARY),
        colon,
        value.to_string().color(TEXT_DEFAULT)
    );
}
