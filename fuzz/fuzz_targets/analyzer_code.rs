#![no_main]

use libfuzzer_sys::fuzz_target;
use helion_guard::{RuleEngine, Severity};
use std::sync::LazyLock;

static ENGINE: LazyLock<RuleEngine> = LazyLock::new(RuleEngine::new);

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let report = ENGINE.analyze_code(s);
        let criticals = report
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();
        assert_eq!(report.passed, criticals == 0);
        assert_eq!(report.critical_count, criticals);

        let recipe = ENGINE.analyze_recipe(s);
        assert_eq!(
            recipe.findings.len(),
            recipe.critical_count + recipe.warning_count
        );
    }
});
