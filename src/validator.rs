//! Static analysis of submitted script text: syntax, denylist, complexity,
//! and duration estimation. Validation is syntactic-only — it compiles the
//! script to check structure but never runs it; runtime protection is the
//! Executor's restricted scope plus its process-level timeout.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::ValidationResult;

/// Identifiers a script must not reference. Rhai itself never binds
/// filesystem/process/module primitives unless an Engine registers them,
/// and this Engine registers none — this list is defense-in-depth lexical
/// scanning, mirroring the original implementation's AST visitor that
/// flagged the same names even though the real protection is structural.
const DENYLISTED_IDENTIFIERS: &[&str] = &[
    "eval", "exec", "import", "open", "file", "input", "compile", "__import__",
];

static DENYLIST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alternation = DENYLISTED_IDENTIFIERS.join("|");
    Regex::new(&format!(r"\b({alternation})\s*\(")).unwrap()
});

static MAIN_FN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bfn\s+main\s*\(").unwrap());

struct ComplexityPattern {
    pattern: Regex,
}

fn compile_all(patterns: &[&str]) -> Vec<ComplexityPattern> {
    patterns
        .iter()
        .map(|p| ComplexityPattern {
            pattern: Regex::new(p).unwrap(),
        })
        .collect()
}

static HIGH_COMPLEXITY: Lazy<Vec<ComplexityPattern>> = Lazy::new(|| {
    compile_all(&[
        r"for\s+\w+\s+in\s+0\.\.[0-9]{4,}",
        r"loop\s*\{",
        r"sleep_ms\([0-9]{5,}\)",
    ])
});

static MEDIUM_COMPLEXITY: Lazy<Vec<ComplexityPattern>> = Lazy::new(|| {
    compile_all(&[
        r"for\s+\w+\s+in\s+0\.\.[0-9]{2,3}",
        r"page\.click\(.*\).*page\.click\(",
    ])
});

static PERFORMANCE_WARNINGS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"sleep_ms\(([0-9]{4,})\)").unwrap(),
            "long sleep detected - consider shorter delays",
        ),
        (
            Regex::new(r"for\s+\w+\s+in\s+0\.\.[0-9]{3,}").unwrap(),
            "large loop detected - may cause timeout",
        ),
        (
            Regex::new(r"loop\s*\{").unwrap(),
            "unbounded loop detected - ensure proper exit condition",
        ),
        (
            Regex::new(r"page\.screenshot\(\).*page\.screenshot\(\).*page\.screenshot\(\)").unwrap(),
            "many screenshots requested - may be slow",
        ),
    ]
});

struct OperationPattern {
    name: &'static str,
    patterns: Vec<Regex>,
}

static OPERATION_PATTERNS: Lazy<Vec<OperationPattern>> = Lazy::new(|| {
    vec![
        OperationPattern {
            name: "navigation",
            patterns: compile_all(&[r"page\.goto\(", r"page\.go_back\(", r"page\.go_forward\("])
                .into_iter()
                .map(|p| p.pattern)
                .collect(),
        },
        OperationPattern {
            name: "form_filling",
            patterns: compile_all(&[r"page\.fill\(", r"page\.type_text\("])
                .into_iter()
                .map(|p| p.pattern)
                .collect(),
        },
        OperationPattern {
            name: "clicking",
            patterns: compile_all(&[r"page\.click\("])
                .into_iter()
                .map(|p| p.pattern)
                .collect(),
        },
        OperationPattern {
            name: "data_extraction",
            patterns: compile_all(&[r"page\.text_content\(", r"page\.query_selector\("])
                .into_iter()
                .map(|p| p.pattern)
                .collect(),
        },
        OperationPattern {
            name: "screenshots",
            patterns: compile_all(&[r"page\.screenshot\(", r"page\.pdf\("])
                .into_iter()
                .map(|p| p.pattern)
                .collect(),
        },
        OperationPattern {
            name: "waiting",
            patterns: compile_all(&[r"page\.wait_for_selector\(", r"sleep_ms\("])
                .into_iter()
                .map(|p| p.pattern)
                .collect(),
        },
        OperationPattern {
            name: "javascript",
            patterns: compile_all(&[r"page\.evaluate\("])
                .into_iter()
                .map(|p| p.pattern)
                .collect(),
        },
    ]
});

pub struct Validator {
    engine: rhai::Engine,
    max_script_size: usize,
}

impl Validator {
    pub fn new(max_script_size: usize) -> Self {
        let mut engine = rhai::Engine::new();
        // No types or functions are registered: the default Engine exposes
        // only Rhai's own value constructors and control flow, nothing
        // filesystem- or process-adjacent.
        engine.set_max_expr_depth(64, 64);
        Self {
            engine,
            max_script_size,
        }
    }

    pub fn validate(&self, script: &str) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if script.len() > self.max_script_size {
            errors.push(format!(
                "script size {} exceeds maximum limit of {} bytes",
                script.len(),
                self.max_script_size
            ));
        }

        for ident in DENYLISTED_IDENTIFIERS {
            if DENYLIST_PATTERN.is_match(script) && script.contains(ident) {
                errors.push(format!("forbidden identifier referenced: {ident}"));
            }
        }

        let ast = match self.engine.compile(script) {
            Ok(ast) => Some(ast),
            Err(e) => {
                errors.push(format!("syntax error: {e}"));
                None
            }
        };

        if let Some(ast) = &ast {
            let has_main = ast.iter_functions().any(|f| f.name == "main" && f.params.is_empty());
            if !has_main {
                errors.push("script must declare an entry-point function 'main' taking no arguments".to_string());
            }
        }

        for (pattern, message) in PERFORMANCE_WARNINGS.iter() {
            if pattern.is_match(script) {
                warnings.push(message.to_string());
            }
        }

        let complexity = estimate_complexity(script);
        let duration = estimate_duration(script, &complexity);
        let operations = detect_operations(script);

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            estimated_complexity: complexity,
            estimated_duration: duration,
            detected_operations: operations,
        }
    }

    pub fn has_main_entrypoint(&self, script: &str) -> bool {
        MAIN_FN_PATTERN.is_match(script)
    }
}

fn estimate_complexity(script: &str) -> String {
    let high_score: usize = HIGH_COMPLEXITY
        .iter()
        .map(|p| p.pattern.find_iter(script).count())
        .sum();
    let medium_score: usize = MEDIUM_COMPLEXITY
        .iter()
        .map(|p| p.pattern.find_iter(script).count())
        .sum();

    if high_score > 0 {
        "high".to_string()
    } else if medium_score > 2 || script.len() > 20_000 {
        "high".to_string()
    } else if medium_score > 0 || script.len() > 5_000 {
        "medium".to_string()
    } else {
        "low".to_string()
    }
}

fn estimate_duration(script: &str, complexity: &str) -> i64 {
    let mut base: i64 = match complexity {
        "low" => 15,
        "medium" => 45,
        "high" => 120,
        _ => 60,
    };

    static GOTO: Lazy<Regex> = Lazy::new(|| Regex::new(r"page\.goto\(").unwrap());
    static WAIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"page\.wait_for_selector\(").unwrap());
    static SHOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"page\.screenshot\(").unwrap());
    static PDF: Lazy<Regex> = Lazy::new(|| Regex::new(r"page\.pdf\(").unwrap());
    static SLEEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"sleep_ms\(([0-9]+)\)").unwrap());

    base += 3 * GOTO.find_iter(script).count() as i64;
    base += 2 * WAIT.find_iter(script).count() as i64;
    base += 1 * SHOT.find_iter(script).count() as i64;
    base += 2 * PDF.find_iter(script).count() as i64;
    for cap in SLEEP.captures_iter(script) {
        if let Ok(ms) = cap[1].parse::<i64>() {
            base += ms / 1000;
        }
    }

    base.min(300)
}

fn detect_operations(script: &str) -> Vec<String> {
    let mut ops: Vec<String> = OPERATION_PATTERNS
        .iter()
        .filter(|op| op.patterns.iter().any(|p| p.is_match(script)))
        .map(|op| op.name.to_string())
        .collect();
    ops.sort();
    ops.dedup();
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(50_000)
    }

    #[test]
    fn empty_script_has_no_main() {
        let result = validator().validate("");
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("main")));
    }

    #[test]
    fn valid_script_with_main_passes() {
        let result = validator().validate("fn main() { #{x: 1} }");
        assert!(result.is_valid, "errors: {:?}", result.errors);
    }

    #[test]
    fn script_over_size_limit_is_rejected() {
        let v = Validator::new(10);
        let result = v.validate("fn main() { 1 }");
        assert!(!result.is_valid);
    }

    #[test]
    fn denylisted_identifier_is_rejected() {
        let result = validator().validate("fn main() { eval(\"1\") }");
        assert!(!result.is_valid);
    }

    #[test]
    fn syntax_error_is_rejected() {
        let result = validator().validate("fn main( {");
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("syntax")));
    }

    #[test]
    fn detects_navigation_operation() {
        let ops = detect_operations("fn main() { page.goto(\"https://example.com\"); }");
        assert!(ops.contains(&"navigation".to_string()));
    }

    #[test]
    fn duration_capped_at_300() {
        let script = "fn main() { sleep_ms(500000) }";
        assert_eq!(estimate_duration(script, "high"), 300);
    }
}
