use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lanrtt::config::FlowsConfig;
use lanrtt::conntrack::correlate::Correlator;
use lanrtt::conntrack::parse::LineParser;
use lanrtt::flow::FlowStore;
use lanrtt::stats::{aggregate, RttSink, TickSummary};

const SYN_RECV: &str = "[1702972533.997256]\t [UPDATE] tcp      6 60 SYN_RECV src=10.152.11.29 dst=61.170.79.234 sport=58765 dport=443 src=61.170.79.234 dst=31.205.218.180 sport=443 dport=58765 id=2857185344";
const ESTABLISHED: &str = "[1702972534.012256]\t [UPDATE] tcp      6 432000 ESTABLISHED src=10.152.11.29 dst=61.170.79.234 sport=58765 dport=443 src=61.170.79.234 dst=31.205.218.180 sport=443 dport=58765 [ASSURED] id=2857185344";
const FIN_WAIT: &str = "[1702972533.785766]\t [UPDATE] tcp      6 120 FIN_WAIT src=10.152.10.141 dst=104.91.71.86 sport=62689 dport=443 src=104.91.71.86 dst=31.205.218.184 sport=443 dport=62689 [ASSURED] id=3451258432";

struct NullSink;

impl RttSink for NullSink {
    fn observe_flow_rtt(&self, rtt_ms: f64) {
        black_box(rtt_ms);
    }

    fn observe_device_mean(&self, mean_ms: f64) {
        black_box(mean_ms);
    }

    fn publish(&self, summary: &TickSummary) {
        black_box(summary);
    }
}

fn bench_parse_line(c: &mut Criterion) {
    let parser = LineParser::new().expect("compile grammar");

    c.bench_function("parse_line/syn_recv", |b| {
        b.iter(|| parser.parse_line(black_box(SYN_RECV)).expect("parse"))
    });

    c.bench_function("parse_line/irrelevant", |b| {
        b.iter(|| parser.parse_line(black_box(FIN_WAIT)).expect("parse"))
    });
}

fn bench_correlate(c: &mut Criterion) {
    let parser = LineParser::new().expect("compile grammar");
    let opening = parser.parse_line(SYN_RECV).expect("parse").expect("event");
    let closing = parser
        .parse_line(ESTABLISHED)
        .expect("parse")
        .expect("event");
    let mut correlator = Correlator::new(&FlowsConfig::default());

    c.bench_function("correlator/open_close_pair", |b| {
        b.iter(|| {
            correlator.handle(black_box(opening.clone()));
            black_box(correlator.handle(black_box(closing.clone())))
        })
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let parser = LineParser::new().expect("compile grammar");
    let opening = parser.parse_line(SYN_RECV).expect("parse").expect("event");
    let closing = parser
        .parse_line(ESTABLISHED)
        .expect("parse")
        .expect("event");
    let mut correlator = Correlator::new(&FlowsConfig::default());
    let store = FlowStore::new(2000);

    for i in 0..2000u64 {
        let mut open = opening.clone();
        let mut close = closing.clone();
        open.id = i;
        close.id = i;
        open.original.src = format!("10.152.{}.{}", i / 250, i % 250);
        correlator.handle(open);
        if let lanrtt::conntrack::correlate::Outcome::Matched(record) = correlator.handle(close) {
            store.record(record);
        }
    }

    c.bench_function("aggregate/full_buffer", |b| {
        b.iter(|| black_box(aggregate(&store, &NullSink)))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_line(c);
    bench_correlate(c);
    bench_aggregate(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
