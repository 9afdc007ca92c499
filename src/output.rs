use console::Style;
use crate::report::ReportSummary;
use crate::state::{RunResult, SurvivedMutant};
use std::path::Path;

pub fn print_error(msg: &str) {
    let style = Style::new().red().bold();
    eprintln!("{} {}", style.apply_to("✗"), msg);
}

pub fn print_success(msg: &str) {
    let style = Style::new().green().bold();
    println!("{} {}", style.apply_to("✓"), msg);
}

fn print_methods_without_tests(methods: &[String]) {
    if methods.is_empty() {
        return;
    }
    let dim = Style::new().dim();
    println!(
        "  {} no tests found for: {}",
        dim.apply_to("·"),
        methods.join(", ")
    );
}

pub fn print_run_result(result: &RunResult, suite: &Path) {
    let score_pct = result.score * 100.0;

    if result.total == 0 {
        let style = Style::new().yellow().bold();
        println!(
            "{} {}: no mutants attempted",
            style.apply_to("!"),
            suite.display(),
        );
        print_methods_without_tests(&result.methods_without_tests);
        return;
    }

    if result.survived == 0 {
        let style = Style::new().green().bold();
        println!(
            "{} {}: {} mutants, all killed ({:.1}%) in {:.1}s",
            style.apply_to("✓"),
            suite.display(),
            result.total,
            score_pct,
            result.duration_ms as f64 / 1000.0,
        );
        print_methods_without_tests(&result.methods_without_tests);
        return;
    }

    let style = if result.passed {
        Style::new().green().bold()
    } else {
        Style::new().yellow().bold()
    };
    println!(
        "{} {}: {} survived / {} mutants ({:.1}% killed) in {:.1}s",
        style.apply_to(if result.passed { "✓" } else { "!" }),
        suite.display(),
        result.survived,
        result.total,
        score_pct,
        result.duration_ms as f64 / 1000.0,
    );

    if result.timeout > 0 {
        let dim = Style::new().dim();
        println!("  {} {} mutants timed out", dim.apply_to("·"), result.timeout);
    }
    print_methods_without_tests(&result.methods_without_tests);

    println!();
    for m in &result.survived_mutants {
        let ref_style = Style::new().cyan().bold();
        let loc_style = Style::new().dim();
        let op_style = Style::new().magenta();

        println!(
            "  {} {}:{} {} {} {}",
            ref_style.apply_to(format!("@{}", m.ref_id)),
            m.file,
            m.line,
            loc_style.apply_to(format!("[{}]", m.turtle)),
            m.method,
            op_style.apply_to(&m.description),
        );
    }
}

pub fn print_mutant_detail(m: &SurvivedMutant) {
    let ref_style = Style::new().cyan().bold();
    let dim = Style::new().dim();

    println!(
        "{} {}:{} [{}]",
        ref_style.apply_to(format!("@{}", m.ref_id)),
        m.file,
        m.line,
        m.turtle,
    );
    println!("  {} {}", dim.apply_to(&m.method), m.description);
    println!();

    for line in m.diff.lines() {
        if line.starts_with('-') {
            let del_style = Style::new().red();
            println!("  {}", del_style.apply_to(line));
        } else if line.starts_with('+') {
            let add_style = Style::new().green();
            println!("  {}", add_style.apply_to(line));
        }
    }
}

pub fn print_status(result: &RunResult) {
    let score_pct = result.score * 100.0;

    println!(
        "Last run: {} mutants, {} killed, {} survived ({:.1}% score)",
        result.total, result.killed, result.survived, score_pct,
    );

    if result.survived > 0 {
        println!();
        for m in &result.survived_mutants {
            let ref_style = Style::new().cyan().bold();
            println!(
                "  {} {}:{} {}",
                ref_style.apply_to(format!("@{}", m.ref_id)),
                m.file,
                m.line,
                m.description,
            );
        }
        println!();
        println!("Use `mutator show @m1` for details on a specific mutant.");
    }
}

pub fn print_report_summary(summary: &ReportSummary, path: &Path) {
    let style = if summary.survived == 0 {
        Style::new().green().bold()
    } else {
        Style::new().yellow().bold()
    };
    println!(
        "{} {}: {} mutants, {} killed, {} survived ({:.1}% score)",
        style.apply_to("·"),
        path.display(),
        summary.total,
        summary.killed,
        summary.survived,
        summary.score * 100.0,
    );
}

pub fn print_method_listing(method: &str, tests: &[String]) {
    let name_style = Style::new().bold();
    let dim = Style::new().dim();
    if tests.is_empty() {
        println!("  {} {}", name_style.apply_to(method), dim.apply_to("(no tests)"));
    } else {
        println!(
            "  {} {}",
            name_style.apply_to(method),
            dim.apply_to(format!("({})", tests.join(", ")))
        );
    }
}
