mod codec_random;
