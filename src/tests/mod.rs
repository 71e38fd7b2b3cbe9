mod thread_pool;
