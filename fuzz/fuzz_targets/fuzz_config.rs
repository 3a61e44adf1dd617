#![no_main]

use libfuzzer_sys::fuzz_target;

use infrastructure::config::AgentConfig;

// Fuzz the configuration parser with arbitrary YAML input.
//
// Exercises serde_yaml_ng deserialization, AgentConfig::validate() and the
// conversion of every rule into its domain form. Must never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(yaml) = std::str::from_utf8(data) else {
        return;
    };
    if yaml.len() > 64 * 1024 {
        return;
    }
    if let Ok(config) = AgentConfig::from_yaml(yaml) {
        let _ = config.nat_config();
        let _ = config.interface_addresses();
        // validate() already converted each rule, so this cannot fail
        assert!(config.nat_rules().is_ok());
    }
});
