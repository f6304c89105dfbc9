//! `fbuild identifier` command.

use anyhow::Result;
use fbuild_core::models::BuildIdentifier;
use fbuild_core::signing::{export_options, identifier, keychain, profile};
use std::path::Path;

/// Prints the build identifier, or with `--json` the file names derived from it.
pub fn handle_identifier_command(team_id: &str, bundle_id: &str, json: bool) -> Result<()> {
    let id = identifier::generate(team_id, bundle_id);

    if json {
        println!("{}", serde_json::to_string_pretty(&describe(&id))?);
    } else {
        println!("{}", id);
    }

    Ok(())
}

fn describe(id: &BuildIdentifier) -> serde_json::Value {
    let relative = Path::new("");
    serde_json::json!({
        "identifier": id.as_str(),
        "keychain": keychain::keychain_path(relative, id),
        "provisioning_profile": profile::installed_profile_path(relative, id),
        "export_options": export_options::export_options_path(relative, id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_lists_derived_names() {
        let id = identifier::generate("ABCD123456", "com.example.app");
        let value = describe(&id);

        assert_eq!(value["identifier"], "abcd123456_com_example_app");
        assert_eq!(value["keychain"], "flutter_abcd123456_com_example_app.keychain");
        assert_eq!(
            value["provisioning_profile"],
            "abcd123456_com_example_app.mobileprovision"
        );
        assert_eq!(
            value["export_options"],
            "build/export_options_abcd123456_com_example_app.plist"
        );
    }
}
