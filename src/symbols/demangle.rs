use backtrace::Symbol;

/// Get the demangled name of a resolved symbol, without the hash suffix.
pub fn function_name(symbol: &Symbol) -> Option<String> {
    let name = symbol.name().map(|name| format!("{name:#}"))?;
    Some(trim_hash(&name).to_string())
}

/// Removes the trailing `::h<16 hex digits>` of a legacy-mangled Rust path,
/// e.g. `app::main::h3777baf656cd0c35` becomes `app::main`.
pub fn trim_hash(name: &str) -> &str {
    let Some(pos) = name.rfind("::") else {
        return name;
    };
    let last = &name[pos + 2..];
    let is_hash = last.len() == 17
        && last.starts_with('h')
        && last[1..].chars().all(|c| c.is_ascii_hexdigit());

    if is_hash { &name[..pos] } else { name }
}
