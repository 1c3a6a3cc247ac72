use std::sync::Arc;

use stripealloc::{
    Allocator, Config, MemMetaStorage, MemStripeMap, NoopFlusher,
};

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record
                    .module_path()
                    .and_then(|path| path.split("::").last())
                    .unwrap_or("?"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

/// 4 segments of 2 stripes of 4 blocks, without a background sweeper.
pub fn small_config() -> Config {
    Config::new()
        .num_segments(4)
        .stripes_per_segment(2)
        .blks_per_stripe(4)
        .num_wb_stripes(4)
        .num_streams(2)
        .flush_every_ms(None)
}

/// An allocator whose metadata and stripe map outlive it, so a second
/// instance opened on the same pair observes a restart.
#[allow(dead_code)]
pub fn open_on(
    config: &Config,
    meta: &MemMetaStorage,
    stripe_map: &MemStripeMap,
) -> Allocator {
    let allocator = Allocator::new(
        config.clone(),
        Arc::new(meta.clone()),
        Arc::new(stripe_map.clone()),
        Arc::new(NoopFlusher),
    )
    .unwrap();
    allocator.init().unwrap();
    allocator
}
