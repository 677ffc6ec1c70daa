use session_watcher::AppError;

#[test]
fn display_prefixes_each_variant() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::NotReady("no runtime".into()), "not ready: no runtime"),
        (AppError::Registry("bad state".into()), "registry: bad state"),
        (AppError::Conflict("locked".into()), "conflict: locked"),
        (AppError::NotFound("vm".into()), "not found: vm"),
        (AppError::Process("spawn".into()), "process: spawn"),
        (AppError::Ipc("socket".into()), "ipc: socket"),
        (AppError::Io("disk".into()), "io: disk"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn io_error_converts() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(ref msg) if msg == "gone"));
}

#[test]
fn toml_error_converts_to_config() {
    let parse_err = toml::from_str::<toml::Value>("a = [").unwrap_err();
    let err: AppError = parse_err.into();
    assert!(matches!(err, AppError::Config(_)));
}
