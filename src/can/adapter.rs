//! Convenience functions to get a CAN adapter.

/// Convenience function to get the first available adapter on the system, using the default configuration.
pub fn get_adapter() -> Result<crate::can::AsyncCanAdapter, crate::error::Error> {
    #[cfg(feature = "usb")]
    {
        let config = crate::mcba::config::McbaConfig::default();
        if let Ok(mcba) = crate::mcba::McbaUsb::new_async(config) {
            return Ok(mcba);
        }
    }

    Err(crate::error::Error::NotFound)
}
