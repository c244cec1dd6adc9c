//! Match-path throughput
//!
//! The matcher sits in the hot class-loading path; this tracks its cost
//! against a realistic descriptor and rule-set size.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use weft_advice::{RuleDecl, RuleSet, RuleSetBuilder};
use weft_bytecode::descriptor::method_flags;
use weft_bytecode::{MethodSig, TypeDescriptor};
use weft_engine::{match_type, AnalyzedHierarchy};

fn build_descriptor(method_count: usize) -> TypeDescriptor {
    let mut descriptor = TypeDescriptor::named("acme/service/OrderService");
    descriptor.superclass = Some("acme/service/AbstractService".to_string());
    descriptor.interfaces = vec!["acme/Lifecycle".to_string(), "acme/Auditable".to_string()];
    for i in 0..method_count {
        descriptor.methods.push(MethodSig {
            name: format!("handle{i}"),
            params: vec!["acme/Request".to_string()],
            ret: "acme/Response".to_string(),
            flags: method_flags::PUBLIC,
        });
    }
    descriptor
}

fn build_hierarchy(descriptor: &TypeDescriptor) -> AnalyzedHierarchy {
    let ancestors = vec![
        Arc::new(TypeDescriptor::named("acme/service/AbstractService")),
        Arc::new(TypeDescriptor::named("acme/Lifecycle")),
        Arc::new(TypeDescriptor::named("acme/Auditable")),
    ];
    let member_names: FxHashSet<String> = ancestors.iter().map(|a| a.name.clone()).collect();
    AnalyzedHierarchy {
        descriptor: Arc::new(descriptor.clone()),
        ancestors,
        member_names,
        unresolved: Vec::new(),
        mixins: Vec::new(),
        rule_version: 1,
    }
}

fn build_rules(rule_count: usize) -> RuleSet {
    let mut builder = RuleSetBuilder::new();
    for i in 0..rule_count {
        let decl = match i % 3 {
            0 => RuleDecl::new(format!("subtype-{i}"), "handle*", format!("ctx-{i}"))
                .subtype_of("acme/service/AbstractService"),
            1 => RuleDecl::new(format!("exact-{i}"), format!("handle{i}"), format!("ctx-{i}"))
                .target("acme/service/OrderService"),
            _ => RuleDecl::new(format!("glob-{i}"), "*", format!("ctx-{i}"))
                .type_matches("other/*"),
        };
        builder.push(decl);
    }
    builder.build(1).unwrap()
}

fn bench_match(c: &mut Criterion) {
    let descriptor = build_descriptor(64);
    let hierarchy = build_hierarchy(&descriptor);
    let rules = build_rules(24);

    c.bench_function("match_type/64_methods_24_rules", |b| {
        b.iter(|| {
            black_box(match_type(
                black_box(&descriptor),
                black_box(&hierarchy),
                black_box(&rules),
            ))
        })
    });
}

criterion_group!(benches, bench_match);
criterion_main!(benches);
