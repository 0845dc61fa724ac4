mod sync_error_paths;
