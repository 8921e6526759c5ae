//! Post-processing that turns raw model output into a scene the renderer accepts.
//!
//! Models routinely wrap code in Markdown fences, forget the scene class, put
//! keyword arguments before positional ones in `self.play(...)`, or stop midway
//! through an expression. These passes repair the common cases without trying to
//! parse Python.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::chunker::{ChunkKind, ContentChunk};

const SCENE_HEADER: &str = "class AutoScene(Scene):";
const FRAME_CONFIG: &str = "config.frame_width = 12\nconfig.frame_height = 8";
const STEP_COLORS: [&str; 6] = ["BLUE", "GREEN", "TEAL", "GOLD", "PURPLE", "MAROON"];
const FALLBACK_TEXT_MAX_CHARS: usize = 100;

const COLOR_DEFINITIONS: &str = "# Color definitions
colorRed = \"#FF5555\"
colorGreen = \"#55FF55\"
colorBlue = \"#5555FF\"
colorYellow = \"#FFFF55\"
colorPurple = \"#AA55AA\"
colorOrange = \"#FFAA55\"
colorWhite = \"#FFFFFF\"
colorBlack = \"#000000\"
";

const COLOR_MARKERS: [&str; 7] = [
    "RED",
    "BLUE",
    "GREEN",
    "color=",
    "set_color",
    "set_fill",
    "set_stroke",
];

const DEFAULT_MAIN_SCENE: &str = "
class MainScene(Scene):
    def construct(self):
        text = Text(\"Animation created with Manim\", font_size=36)
        text.move_to(ORIGIN)

        self.play(Write(text))
        self.wait(1)

        shape = Square(side_length=3)
        shape.next_to(text, DOWN, buff=0.5)
        self.play(Create(shape))
        self.wait(2)
";

static KEYWORD_ARG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[A-Za-z_]\w*\s*=[^=]").expect("invalid keyword arg regex"));

/// Strip Markdown code fences and surrounding whitespace.
pub fn clean_code(code: &str) -> String {
    code.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn is_manim_import(line: &str) -> bool {
    let line = line.trim();
    line.starts_with("from manim import") || line == "import manim"
}

fn indent_of(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Make sure the code defines `AutoScene` with a `construct` method, imports
/// manim, sets the frame size and waits at least once.
pub fn add_safeguards(code: &str) -> String {
    let mut code = if !code.contains("class AutoScene(Scene)") {
        wrap_in_scene(code)
    } else {
        let mut code = code.to_string();
        if !code.contains("from manim import") {
            code = format!("from manim import *\n\n{}", code);
        }
        if !code.contains("def construct(self)") {
            code = code.replacen(
                SCENE_HEADER,
                &format!("{}\n    def construct(self):\n        self.wait(1)\n", SCENE_HEADER),
                1,
            );
        }
        code
    };

    if !code.contains("config.frame_") {
        code = insert_after_import(&code, FRAME_CONFIG);
    }

    if !code.contains("self.wait(") {
        code = insert_wait(&code);
    }

    fix_play_argument_order(&code)
}

fn wrap_in_scene(code: &str) -> String {
    let body: Vec<&str> = code.lines().filter(|l| !is_manim_import(l)).collect();
    let body = body.join("\n");
    let body = body.trim_matches('\n');

    let mut out =
        String::from("from manim import *\n\nclass AutoScene(Scene):\n    def construct(self):\n");
    if body.trim().is_empty() {
        out.push_str("        self.wait(1)\n");
        return out;
    }

    for line in body.lines() {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str("        ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Insert `block` after the first manim import, or at the top when there is none.
fn insert_after_import(code: &str, block: &str) -> String {
    let lines: Vec<&str> = code.lines().collect();
    match lines.iter().position(|l| is_manim_import(l)) {
        Some(idx) => {
            let mut out: Vec<&str> = lines[..=idx].to_vec();
            out.push(block);
            out.extend_from_slice(&lines[idx + 1..]);
            out.join("\n")
        }
        None => format!("{}\n{}", block, code),
    }
}

fn insert_wait(code: &str) -> String {
    let mut out = Vec::new();
    let mut inserted = false;
    for line in code.lines() {
        out.push(line.to_string());
        if !inserted && line.trim_start().starts_with("def construct(self)") {
            out.push(format!("{}    self.wait(1)", indent_of(line)));
            inserted = true;
        }
    }
    out.join("\n")
}

/// Byte offsets of top-level commas and of the paren closing the call that
/// starts at `open + 1`, ignoring brackets inside string literals.
fn scan_call(s: &str) -> Option<(Vec<usize>, usize)> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut commas = Vec::new();

    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                if depth == 0 {
                    return (c == ')').then_some((commas, i));
                }
                depth -= 1;
            }
            ',' if depth == 0 => commas.push(i),
            _ => {}
        }
    }
    None
}

/// Reorder `self.play(...)` arguments so positional ones precede keyword ones.
/// Only single-line calls that pass `rate_func=` are touched.
pub fn fix_play_argument_order(code: &str) -> String {
    let fixed: Vec<String> = code
        .lines()
        .map(|line| reorder_play_line(line).unwrap_or_else(|| line.to_string()))
        .collect();

    let mut out = fixed.join("\n");
    if code.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn reorder_play_line(line: &str) -> Option<String> {
    if !line.contains("rate_func=") || line.trim_end().ends_with(',') {
        return None;
    }

    let start = line.find("self.play(")? + "self.play(".len();
    let inner = &line[start..];
    let (commas, close) = scan_call(inner)?;

    let mut args = Vec::new();
    let mut prev = 0;
    for &comma in &commas {
        args.push(inner[prev..comma].trim());
        prev = comma + 1;
    }
    args.push(inner[prev..close].trim());
    args.retain(|a| !a.is_empty());

    let (keyword, positional): (Vec<&str>, Vec<&str>) =
        args.iter().partition(|a| KEYWORD_ARG_RE.is_match(a));
    if keyword.is_empty() || positional.is_empty() {
        return None;
    }

    let reordered: Vec<&str> = positional.into_iter().chain(keyword).collect();
    if reordered == args {
        return None;
    }

    Some(format!(
        "{}{}{}",
        &line[..start],
        reordered.join(", "),
        &line[start + close..]
    ))
}

/// Closers for brackets left open, innermost first. Strings and comments are skipped.
fn missing_closers(code: &str) -> Vec<char> {
    let mut stack = Vec::new();

    for line in code.lines() {
        let mut quote: Option<char> = None;
        let mut escaped = false;

        for c in line.chars() {
            if let Some(q) = quote {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                continue;
            }

            match c {
                '#' => break,
                '"' | '\'' => quote = Some(c),
                '(' => stack.push(')'),
                '[' => stack.push(']'),
                '{' => stack.push('}'),
                ')' | ']' | '}' => {
                    stack.pop();
                }
                _ => {}
            }
        }
    }

    stack.into_iter().rev().collect()
}

/// Last repair pass before submission: argument order, unbalanced brackets,
/// colour constants and a scene class when none exists.
pub fn ensure_color_definitions(code: &str) -> String {
    let mut code = fix_play_argument_order(code);

    for closer in missing_closers(&code) {
        code.push('\n');
        code.push(closer);
    }

    if !COLOR_MARKERS.iter().any(|m| code.contains(m)) {
        code = if code.contains("from manim import") {
            insert_after_last_import(&code, COLOR_DEFINITIONS)
        } else {
            format!("from manim import *\n\n{}\n{}", COLOR_DEFINITIONS, code)
        };
    }

    if !code.contains("class ") && !code.contains("def construct") {
        code.push('\n');
        code.push_str(DEFAULT_MAIN_SCENE);
    }

    code
}

fn insert_after_last_import(code: &str, block: &str) -> String {
    let lines: Vec<&str> = code.lines().collect();
    let idx = lines
        .iter()
        .rposition(|l| {
            let t = l.trim_start();
            t.starts_with("import ") || t.starts_with("from ")
        })
        .unwrap_or(0);

    let mut out: Vec<&str> = lines[..=idx.min(lines.len().saturating_sub(1))].to_vec();
    out.push("");
    out.push(block);
    if idx + 1 < lines.len() {
        out.extend_from_slice(&lines[idx + 1..]);
    }
    out.join("\n")
}

fn escape_python_string(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\n', '\r'], " ")
}

/// Deterministic scene used when code generation fails for a step.
pub fn fallback_scene(step: u32, chunks: &[ContentChunk]) -> String {
    let text = chunks
        .iter()
        .filter(|c| c.kind == ChunkKind::Text)
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let text = if text.trim().is_empty() {
        "Step content".to_string()
    } else {
        text
    };

    let excerpt: String = text.chars().take(FALLBACK_TEXT_MAX_CHARS).collect();
    let excerpt = escape_python_string(&excerpt);
    let color = STEP_COLORS[step as usize % STEP_COLORS.len()];
    let shape = if step % 2 == 0 {
        "Square(side_length=3)"
    } else {
        "Circle(radius=1.5)"
    };

    format!(
        r#"from manim import *

config.frame_width = 12
config.frame_height = 8

class AutoScene(Scene):
    def construct(self):
        title = Text("Step {step}", font_size=48)
        self.play(Write(title))
        self.wait(1)
        self.play(title.animate.scale(0.5).to_edge(UP))

        text = Text("{excerpt}...", font_size=28, line_spacing=1.5)
        text.next_to(title, DOWN, buff=0.5)
        self.play(FadeIn(text))

        shape = {shape}
        shape.set_stroke({color})
        shape.next_to(text, DOWN, buff=1)
        self.play(Create(shape))
        self.wait(1)

        self.play(shape.animate.set_fill({color}, opacity=0.3))
        self.wait(2)
"#
    )
}
