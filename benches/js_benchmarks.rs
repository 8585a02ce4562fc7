use criterion::{Criterion, black_box, criterion_group, criterion_main};
use taskjs::{EngineConfig, EvalOptions, Interpreter, Pool, evaluate_script};

const FIB: &str = r#"
    function fib(n) {
        if (n <= 1) return n;
        var a = 0;
        var b = 1;
        for (var i = 2; i <= n; i = i + 1) {
            var c = a + b;
            a = b;
            b = c;
        }
        return b;
    }
    var sum = 0;
    for (var i = 0; i < 1000; i = i + 1) {
        sum = sum + fib(30);
    }
    return sum;
"#;

const JSON_ROUND: &str = r#"
    var data = '{"name": "test", "value": 42, "items": [1, 2, 3]}';
    var sum = 0;
    for (var i = 0; i < 1000; i = i + 1) {
        var obj = JSON.parse(data);
        sum = sum + obj.value;
    }
    return { sum: sum, items: JSON.parse(data).items };
"#;

const TRIVIAL: &str = "return 1 + 1";

fn config() -> EngineConfig {
    EngineConfig::default()
}

fn bench_one_shot(c: &mut Criterion) {
    let config = config();
    c.bench_function("one-shot trivial", |b| {
        b.iter(|| black_box(evaluate_script(&config, EvalOptions::new(TRIVIAL)).unwrap()))
    });
}

fn bench_reused_interpreter(c: &mut Criterion) {
    let interpreter = Interpreter::new(&config()).unwrap();

    c.bench_function("interpreter trivial", |b| {
        b.iter(|| black_box(interpreter.eval(EvalOptions::new(TRIVIAL)).unwrap()))
    });
    c.bench_function("interpreter fib_iter 1k", |b| {
        b.iter(|| black_box(interpreter.eval(EvalOptions::new(FIB)).unwrap()))
    });
    c.bench_function("interpreter json parse 1k", |b| {
        b.iter(|| black_box(interpreter.eval(EvalOptions::new(JSON_ROUND)).unwrap()))
    });
}

fn bench_pool(c: &mut Criterion) {
    let pool = Pool::new(&config()).unwrap();

    c.bench_function("pool trivial", |b| {
        b.iter(|| black_box(pool.eval(EvalOptions::new(TRIVIAL)).unwrap()))
    });
    c.bench_function("pool fib_iter 1k", |b| {
        b.iter(|| black_box(pool.eval(EvalOptions::new(FIB)).unwrap()))
    });
}

criterion_group!(benches, bench_one_shot, bench_reused_interpreter, bench_pool);

criterion_main!(benches);
