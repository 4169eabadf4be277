//! Rule evaluator performance benchmarks.
//!
//! Measures the cost of the tag-scan stages (§4.2, stages 2-3) which run on
//! every movement with more than one rule, and the auto-select fast path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use takt::application::rule_evaluator::scan_tag;
use takt::domain::models::piece::{Movement, PermissionMode, Rule};

fn rule(condition: &str, next: &str) -> Rule {
    Rule {
        condition: condition.to_string(),
        next: Some(next.to_string()),
        appendix: None,
        is_ai: false,
        is_aggregate: false,
        aggregate_type: None,
        aggregate_text: None,
    }
}

fn movement_with_rules(n: usize) -> Movement {
    let rules = (0..n)
        .map(|i| rule(&format!("cond-{i}"), &format!("next-{i}")))
        .collect();
    Movement {
        name: "implement".to_string(),
        persona: "coder".to_string(),
        persona_display_name: None,
        instruction_template: "do it".to_string(),
        pass_previous_response: false,
        rules,
        output_contracts: vec![],
        parallel: vec![],
        arpeggio: None,
        team_leader: None,
        edit: false,
        permission_mode: Some(PermissionMode::Default),
        provider: None,
        model: None,
    }
}

fn bench_scan_tag(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_tag");

    group.bench_function("early_match", |b| {
        let content = "[IMPLEMENT:1] done, moving on";
        b.iter(|| scan_tag(black_box(content), black_box("implement")));
    });

    group.bench_function("no_match_short", |b| {
        let content = "finished the task, nothing structured here";
        b.iter(|| scan_tag(black_box(content), black_box("implement")));
    });

    for size_kb in [1usize, 16, 64] {
        let mut content = "lorem ipsum dolor sit amet ".repeat(size_kb * 1024 / 28);
        content.push_str(" [IMPLEMENT:3]");
        group.bench_with_input(BenchmarkId::new("late_match", size_kb), &content, |b, content| {
            b.iter(|| scan_tag(black_box(content), black_box("implement")));
        });
    }

    group.bench_function("many_unrelated_brackets", |b| {
        let content = "[FOO:1] [BAR:2] [BAZ:3] [IMPLEMENT:2]".to_string();
        b.iter(|| scan_tag(black_box(&content), black_box("implement")));
    });

    group.finish();
}

fn bench_movement_rule_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("movement_rules");

    for rule_count in [1usize, 5, 20] {
        let m = movement_with_rules(rule_count);
        let content = format!("[IMPLEMENT:{rule_count}] done");
        group.bench_with_input(
            BenchmarkId::new("scan_tag_over_rule_count", rule_count),
            &(m, content),
            |b, (m, content)| {
                b.iter(|| scan_tag(black_box(content), black_box(&m.name)));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_scan_tag, bench_movement_rule_count);
criterion_main!(benches);
