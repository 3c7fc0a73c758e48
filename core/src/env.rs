// III-IV
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Utilities to deal with environment variables.

use std::env;

/// Result type for environment errors.
type Result<T> = std::result::Result<T, String>;

/// Gets the environment variable whose name matches `<prefix>_<suffix>` ignoring case.
///
/// Returns the actual name of the variable along with its value.  Fails if the value is not valid
/// UTF-8 or if more than one variable matches and their values differ.
pub fn get_var_ignore_case(prefix: &str, suffix: &str) -> Result<Option<(String, String)>> {
    let wanted = format!("{}_{}", prefix, suffix);

    let mut found: Option<(String, String)> = None;
    for (name, value) in env::vars_os() {
        let name = match name.to_str() {
            Some(name) if name.eq_ignore_ascii_case(&wanted) => name.to_owned(),
            _ => continue,
        };
        let value = match value.into_string() {
            Ok(value) => value,
            Err(_) => return Err(format!("Invalid value in environment variable {}", name)),
        };
        match &found {
            Some((other_name, other_value)) if *other_value != value => {
                return Err(format!(
                    "Ambiguous environment variables {} and {} have different values",
                    other_name, name
                ));
            }
            Some(_) => (),
            None => found = Some((name, value)),
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn test_get_var_ignore_case() {
        temp_env::with_vars([("IgnCase_Field", Some("v")), ("IGNCASE_OTHER", Some("x"))], || {
            assert_eq!(
                Some(("IgnCase_Field".to_owned(), "v".to_owned())),
                get_var_ignore_case("igncase", "field").unwrap()
            );
            assert_eq!(None, get_var_ignore_case("igncase", "missing").unwrap());
        });
    }

    #[test]
    fn test_get_var_ignore_case_duplicates() {
        temp_env::with_vars([("DUPS_FIELD", Some("a")), ("dups_field", Some("a"))], || {
            let (_, value) = get_var_ignore_case("Dups", "Field").unwrap().unwrap();
            assert_eq!("a", value);
        });

        temp_env::with_vars([("DUPS_FIELD", Some("a")), ("dups_field", Some("b"))], || {
            let err = get_var_ignore_case("Dups", "Field").unwrap_err();
            assert!(err.starts_with("Ambiguous environment variables"));
        });
    }

    #[test]
    fn test_get_var_ignore_case_not_utf8() {
        temp_env::with_var("NOTUTF8_FIELD", Some(OsStr::from_bytes(b"\xc3\x28")), || {
            assert_eq!(
                "Invalid value in environment variable NOTUTF8_FIELD",
                get_var_ignore_case("notutf8", "field").unwrap_err()
            );
        });
    }
}
