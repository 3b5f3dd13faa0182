fn main() {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .level_for("particles", log::LevelFilter::Debug)
        .chain(std::io::stdout())
        .apply()
        .expect("failed to initialize logging");

    particles::start();
}
