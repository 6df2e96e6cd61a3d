// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Initializes logging features. The log specification is read from `RUST_LOG`, falling back to `default_spec`.
pub fn initialize_with(default_spec: &str) {
    INIT_LOG.call_once(|| {
        let logger: Logger = match Logger::try_with_env_or_str(default_spec) {
            Ok(logger) => logger,
            Err(e) => {
                eprintln!("initialize(): invalid log specification ({:?})", e);
                return;
            },
        };
        // The embedding process may have installed its own logger already.
        if let Err(e) = logger.start() {
            eprintln!("initialize(): failed to start logger ({:?})", e);
        }
    });
}

/// Initializes logging features with warnings enabled by default.
pub fn initialize() {
    initialize_with("warn")
}
